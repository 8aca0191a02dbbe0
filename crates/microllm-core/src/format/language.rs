//! Language constraint blocks.
//!
//! The preamble opens every conversation; the reinforcement is appended after a
//! full history replay so the most recently decoded instruction names the
//! current target language.

/// Resolve `requested` against the supported list (case-insensitive).
/// Blank or unknown names yield `default`.
pub fn resolve_language(default: &str, supported: &[String], requested: &str) -> String {
    let requested = requested.trim();
    if requested.is_empty() {
        return default.to_string();
    }
    if supported.is_empty() {
        return requested.to_string();
    }
    supported
        .iter()
        .find(|l| l.eq_ignore_ascii_case(requested))
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

pub fn preamble_text(language: &str) -> String {
    format!(
        "You are a helpful assistant. Respond only in {language}. \
         Never switch to another language, even if the user writes in one."
    )
}

pub fn reinforcement_text(language: &str) -> String {
    format!("Reminder: from now on, reply only in {language}.")
}
