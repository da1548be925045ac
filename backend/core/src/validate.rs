//! Client-side checks mirroring the backend's request validation.

use std::sync::LazyLock;

use regex::Regex;

static IDENTITY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap());
static CALL_SID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^CA[a-f0-9]{32}$").unwrap());
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+?[0-9(][0-9()\-.\s]*$").unwrap());

pub fn is_valid_identity(identity: &str) -> bool {
    IDENTITY_RE.is_match(identity)
}

pub fn is_valid_call_sid(call_sid: &str) -> bool {
    CALL_SID_RE.is_match(call_sid)
}

/// Accepts PSTN numbers (at least three digits, common separators allowed)
/// and `client:<identity>` addresses.
pub fn is_dialable(destination: &str) -> bool {
    let destination = destination.trim();
    if let Some(client) = destination.strip_prefix("client:") {
        return is_valid_identity(client);
    }
    PHONE_RE.is_match(destination)
        && destination.chars().filter(char::is_ascii_digit).count() >= 3
}
