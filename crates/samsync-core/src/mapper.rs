//! Provider JSON to workspace entities.
//!
//! Pure functions with no I/O. Optional fields never fail a mapping; only
//! non-object payloads, missing identifiers and wrongly typed fields do.

use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use samsync_ingest::{
    Account, AccountStatus, Contact, Conversation, ConversationStatus, Message,
};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};

pub const UNKNOWN_NAME: &str = "Unknown";
pub const SYNTHESIZED_PREFIX: &str = "syn_";

type Object = Map<String, Value>;

fn as_object<'a>(kind: &str, value: &'a Value) -> Result<&'a Object> {
    value
        .as_object()
        .ok_or_else(|| SyncError::Mapping(format!("{} payload is not an object: {}", kind, value)))
}

/// Optional string field. Numbers are accepted and stringified; blank strings count as absent.
fn opt_str(obj: &Object, key: &str) -> Result<Option<String>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(SyncError::Mapping(format!(
            "field `{}` has unexpected type: {}",
            key, other
        ))),
    }
}

fn required_str(kind: &str, obj: &Object, key: &str) -> Result<String> {
    opt_str(obj, key)?
        .ok_or_else(|| SyncError::Mapping(format!("{} is missing `{}`", kind, key)))
}

/// Boolean flag encoded as `true/false`, `0/1` or their string forms.
fn flag(obj: &Object, key: &str) -> Result<bool> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            other => Err(SyncError::Mapping(format!(
                "field `{}` is not a flag: {}",
                key, other
            ))),
        },
        Some(other) => Err(SyncError::Mapping(format!(
            "field `{}` is not a flag: {}",
            key, other
        ))),
    }
}

fn count(obj: &Object, key: &str) -> Result<i64> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => Ok(n.as_i64().unwrap_or(0).max(0)),
        Some(Value::String(s)) => s.trim().parse::<i64>().map_err(|_| {
            SyncError::Mapping(format!("field `{}` is not a number: {}", key, s))
        }),
        Some(other) => Err(SyncError::Mapping(format!(
            "field `{}` is not a number: {}",
            key, other
        ))),
    }
}

fn epoch_to_utc(raw: i64) -> Option<DateTime<Utc>> {
    // Anything past 10^11 seconds is year 5138; treat it as milliseconds.
    if raw.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

/// RFC 3339 strings, or epoch seconds / milliseconds (number or numeric string).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| s.parse::<i64>().ok().and_then(epoch_to_utc))
        }
        Value::Number(n) => n.as_i64().and_then(epoch_to_utc),
        _ => None,
    }
}

fn timestamp(obj: &Object, key: &str) -> Option<DateTime<Utc>> {
    obj.get(key).and_then(parse_timestamp)
}

/// Split a display name on the first whitespace run.
///
/// Blank names yield `("Unknown", None)`.
pub fn split_name(name: Option<&str>) -> (String, Option<String>) {
    let name = name.map(str::trim).unwrap_or("");
    if name.is_empty() {
        return (UNKNOWN_NAME.to_string(), None);
    }
    match name.split_once(char::is_whitespace) {
        Some((first, rest)) => {
            let rest = rest.trim();
            (
                first.to_string(),
                (!rest.is_empty()).then(|| rest.to_string()),
            )
        }
        None => (name.to_string(), None),
    }
}

/// `"<title> at <company>"` into its parts.
pub fn split_occupation(occupation: &str) -> (Option<String>, Option<String>) {
    let occupation = occupation.trim();
    if occupation.is_empty() {
        return (None, None);
    }
    match occupation.rsplit_once(" at ") {
        Some((title, company)) if !title.trim().is_empty() && !company.trim().is_empty() => (
            Some(title.trim().to_string()),
            Some(company.trim().to_string()),
        ),
        _ => (Some(occupation.to_string()), None),
    }
}

fn normalize_body(body: &str) -> String {
    body.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic key for a message the provider sent without an id.
pub fn synthesize_message_id(
    conversation_external_id: &str,
    sent_at: Option<&DateTime<Utc>>,
    body: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(conversation_external_id.as_bytes());
    hasher.update([0u8]);
    if let Some(ts) = sent_at {
        hasher.update(samsync_ingest::format_ts(ts).as_bytes());
    }
    hasher.update([0u8]);
    hasher.update(normalize_body(body).as_bytes());
    format!("{}{}", SYNTHESIZED_PREFIX, hex::encode(hasher.finalize()))
}

fn account_status(obj: &Object) -> AccountStatus {
    let statuses: Vec<String> = obj
        .get("sources")
        .and_then(Value::as_array)
        .map(|sources| {
            sources
                .iter()
                .filter_map(|s| s.get("status").and_then(Value::as_str))
                .map(|s| s.to_ascii_uppercase())
                .collect()
        })
        .unwrap_or_default();

    if statuses.iter().any(|s| s == "OK") {
        AccountStatus::Connected
    } else if statuses.iter().any(|s| s == "CREDENTIALS") {
        AccountStatus::CredentialsRequired
    } else if statuses
        .iter()
        .any(|s| matches!(s.as_str(), "STOPPED" | "ERROR" | "PERMISSIONS" | "DELETED"))
    {
        AccountStatus::Disconnected
    } else {
        AccountStatus::Unknown
    }
}

/// `default_provider` names accounts whose payload carries no `type`.
pub fn map_account(default_provider: &str, value: &Value) -> Result<Account> {
    let obj = as_object("account", value)?;
    let external_id = required_str("account", obj, "id")?;
    let provider = opt_str(obj, "type")?
        .map(|t| t.to_ascii_lowercase())
        .unwrap_or_else(|| default_provider.to_string());
    Ok(Account {
        external_id,
        provider,
        display_name: opt_str(obj, "name")?,
        status: account_status(obj),
    })
}

pub fn map_conversation(account_id: &str, provider: &str, value: &Value) -> Result<Conversation> {
    let obj = as_object("chat", value)?;
    let external_id = required_str("chat", obj, "id")?;
    let name = opt_str(obj, "name")?;
    let (first, last) = split_name(name.as_deref());
    let status = if flag(obj, "archived")? {
        ConversationStatus::Archived
    } else {
        ConversationStatus::Active
    };

    Ok(Conversation {
        external_id,
        account_id: opt_str(obj, "account_id")?.unwrap_or_else(|| account_id.to_string()),
        provider: provider.to_string(),
        participant_name: name.unwrap_or_else(|| UNKNOWN_NAME.to_string()),
        participant_first_name: first,
        participant_last_name: last,
        participant_company: None,
        participant_profile_id: opt_str(obj, "attendee_provider_id")?,
        last_activity_at: timestamp(obj, "timestamp"),
        status,
        unread_count: count(obj, "unread_count")?,
    })
}

pub fn map_message(conversation_external_id: &str, value: &Value) -> Result<Message> {
    let obj = as_object("message", value)?;
    let body = match obj.get("text") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(SyncError::Mapping(format!(
                "message text has unexpected type: {}",
                other
            )))
        }
    };
    let sent_at = timestamp(obj, "timestamp");
    let provider_message_id = opt_str(obj, "id")?;
    let (external_id, id_synthesized) = match &provider_message_id {
        Some(id) => (id.clone(), false),
        None => (
            synthesize_message_id(conversation_external_id, sent_at.as_ref(), &body),
            true,
        ),
    };

    Ok(Message {
        external_id,
        provider_message_id,
        id_synthesized,
        is_sender: flag(obj, "is_sender")?,
        body,
        sent_at,
        sender_external_id: opt_str(obj, "sender_id")?,
    })
}

/// Map a chat attendee. The account owner (`is_self`) yields `None`.
pub fn map_contact(provider: &str, value: &Value) -> Result<Option<Contact>> {
    let obj = as_object("attendee", value)?;
    if flag(obj, "is_self")? {
        return Ok(None);
    }

    let external_id = match opt_str(obj, "provider_id")? {
        Some(id) => id,
        None => required_str("attendee", obj, "id")?,
    };
    let full_name = opt_str(obj, "name")?;
    let (first_name, last_name) = split_name(full_name.as_deref());

    let occupation = obj
        .get("specifics")
        .and_then(Value::as_object)
        .map(|s| opt_str(s, "occupation"))
        .transpose()?
        .flatten();
    let (title, company) = occupation
        .as_deref()
        .map(split_occupation)
        .unwrap_or((None, None));

    Ok(Some(Contact {
        external_id,
        provider: provider.to_string(),
        first_name,
        last_name,
        full_name,
        company,
        title,
        headline: occupation,
        profile_url: opt_str(obj, "profile_url")?,
        picture_url: opt_str(obj, "picture_url")?,
    }))
}

/// Fill participant details the chat listing left out from the attendee.
pub fn enrich_conversation(conversation: &mut Conversation, contact: &Contact) {
    if conversation.participant_first_name == UNKNOWN_NAME {
        if let Some(name) = &contact.full_name {
            conversation.participant_name = name.clone();
            conversation.participant_first_name = contact.first_name.clone();
            conversation.participant_last_name = contact.last_name.clone();
        }
    }
    if conversation.participant_company.is_none() {
        conversation.participant_company = contact.company.clone();
    }
    if conversation.participant_profile_id.is_none() {
        conversation.participant_profile_id = Some(contact.external_id.clone());
    }
}

/// Oldest first (stable), duplicates by `external_id` collapsed, first wins.
pub fn normalize_messages(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by_key(|m| m.sent_at);
    let mut seen = HashSet::new();
    messages.retain(|m| seen.insert(m.external_id.clone()));
    messages
}
