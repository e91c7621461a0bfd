//! Rendering shared by the engine CLIs: terminal lines and the `--json`
//! document.

use crate::core::time;
use colored::Colorize;
use serde_json::Value as JsonValue;

/// Width for validator and integrity messages in text output.
pub const MESSAGE_WIDTH: usize = 160;

/// `message` on a single line, cut at `width` characters with a trailing `…`.
pub fn one_line(message: &str, width: usize) -> String {
    let mut words = message.split_whitespace();
    let mut line = String::new();
    if let Some(first) = words.next() {
        line.push_str(first);
        for word in words {
            line.push(' ');
            line.push_str(word);
        }
    }
    match line.char_indices().nth(width) {
        Some((cut, _)) => {
            line.truncate(cut);
            line.push('…');
            line
        }
        None => line,
    }
}

/// Indented `- item` lines for record paths or messages. Items past `limit`
/// collapse into a final `… and N more` line.
pub fn indented_list(items: &[String], limit: usize) -> String {
    let mut lines: Vec<String> = items
        .iter()
        .take(limit)
        .map(|item| format!("  - {}", one_line(item, MESSAGE_WIDTH)))
        .collect();
    if items.len() > limit {
        lines.push(format!("  … and {} more", items.len() - limit));
    }
    lines.join("\n")
}

/// Colored tag for a severity or status word (`error`, `warning`, `valid`, ...).
pub fn badge(word: &str) -> String {
    match word {
        "error" | "errors" | "failed" => word.bright_red().bold().to_string(),
        "warning" | "warnings" => word.bright_yellow().to_string(),
        "info" => word.bright_cyan().to_string(),
        "valid" | "ok" | "fixed" => word.bright_green().to_string(),
        other => other.to_string(),
    }
}

/// Top-level `--json` document: `command`, `ok`, `runId` and `at`, merged
/// with the fields of `body`.
pub fn json_document(command: &str, ok: bool, body: JsonValue) -> JsonValue {
    let mut doc = serde_json::Map::new();
    doc.insert("command".to_string(), JsonValue::from(command));
    doc.insert("ok".to_string(), JsonValue::from(ok));
    doc.insert("runId".to_string(), JsonValue::from(time::new_run_id()));
    doc.insert("at".to_string(), JsonValue::from(time::now_epoch_secs()));
    if let JsonValue::Object(fields) = body {
        doc.extend(fields);
    }
    JsonValue::Object(doc)
}
