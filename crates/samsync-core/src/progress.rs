//! Line-oriented progress protocol for a supervising UI process.
//!
//! Each event is one stdout line: a fixed prefix followed by compact JSON.
//!
//! - `SAMSYNC_PROGRESS:{"account":"...","status":"syncing",...}`
//! - `SAMSYNC_RESULT:{"type":"sync","status":"complete","data":{...}}`

use std::io::Write;

use serde_json::{json, Value};

pub const PROGRESS_PREFIX: &str = "SAMSYNC_PROGRESS:";
pub const RESULT_PREFIX: &str = "SAMSYNC_RESULT:";

fn progress_line(account: &str, status: &str, message: &str, processed: Option<usize>) -> String {
    let payload = json!({
        "account": account,
        "status": status,
        "message": message,
        "conversations_processed": processed,
    });
    format!("{}{}", PROGRESS_PREFIX, payload)
}

fn result_line(result_type: &str, status: &str, data: Value) -> String {
    let payload = json!({
        "type": result_type,
        "status": status,
        "data": data,
    });
    format!("{}{}", RESULT_PREFIX, payload)
}

/// # Arguments
/// * `account` - Provider account being synced
/// * `status` - "syncing", "error" or "cancelled"
/// * `message` - Human-readable progress message
/// * `processed` - Conversations handled so far
pub fn emit_progress(account: &str, status: &str, message: &str, processed: Option<usize>) {
    println!("{}", progress_line(account, status, message, processed));
    let _ = std::io::stdout().flush();
}

/// Final outcome of an operation (`status` is "complete", "cancelled" or "error").
pub fn emit_result(result_type: &str, status: &str, data: Value) {
    println!("{}", result_line(result_type, status, data));
    let _ = std::io::stdout().flush();
}

pub fn emit_error(account: &str, message: &str) {
    emit_progress(account, "error", message, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_line_is_prefixed_json() {
        let line = progress_line("acc_a", "syncing", "3 conversations", Some(3));
        let body = line.strip_prefix(PROGRESS_PREFIX).unwrap();
        let value: Value = serde_json::from_str(body).unwrap();
        assert_eq!(value["account"], "acc_a");
        assert_eq!(value["conversations_processed"], 3);
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_result_line_carries_data() {
        let line = result_line("sync", "complete", json!({"processed": 1}));
        let value: Value = serde_json::from_str(line.strip_prefix(RESULT_PREFIX).unwrap()).unwrap();
        assert_eq!(value["type"], "sync");
        assert_eq!(value["data"]["processed"], 1);
    }
}
