//! Terminal output helpers. Warnings and errors go to stderr.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub fn success(msg: &str) {
    println!("{} {}", style("✔").green(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} {}", style("✖").red().bold(), msg);
}

pub fn warn(msg: &str) {
    eprintln!("{} {}", style("!").yellow().bold(), msg);
}

/// Indented plain line.
pub fn info(msg: &str) {
    println!("  {}", msg);
}

pub fn header(title: &str) {
    println!();
    println!("  {}", style(title).bold().underlined());
    println!();
}

/// Aligned `label  value` row.
pub fn row(label: &str, value: &str) {
    println!("  {:<16} {}", style(label).dim(), value);
}

/// Steady-ticking spinner on stderr; callers finish or abandon it.
pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(tpl) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} {elapsed:.dim}") {
        pb.set_style(tpl);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
