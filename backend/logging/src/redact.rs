//! Log Redaction Layer
//!
//! Scrubs access tokens, API keys, and phone numbers from strings prior to logging.

use regex::Regex;
use std::sync::LazyLock;

static JWT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"eyJ[a-zA-Z0-9_\-]+\.[a-zA-Z0-9_\-]+\.[a-zA-Z0-9_\-]*").unwrap()
});
static API_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(sk-[a-zA-Z0-9]{32,})|(Bearer\s+[a-zA-Z0-9\-\._~+/]+=*)").unwrap()
});
static TELEPHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+?\d{1,3}[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}").unwrap()
});

/// Redacts sensitive patterns in a string.
pub fn redact_sensitive_data(input: &str) -> String {
    // Tokens first: a JWT body can contain digit runs that look like phone numbers.
    let redacted = JWT_RE.replace_all(input, "[REDACTED_TOKEN]");
    let redacted = API_KEY_RE.replace_all(&redacted, "[REDACTED_TOKEN]");
    TELEPHONE_RE
        .replace_all(&redacted, "[REDACTED_PHONE]")
        .into_owned()
}

/// Masks all but the last four digits of a dialed number, e.g. `+1******4567`.
pub fn mask_number(number: &str) -> String {
    let digits = number.chars().filter(char::is_ascii_digit).count();
    if digits <= 4 {
        return number.to_string();
    }
    let mut remaining = digits;
    number
        .chars()
        .map(|c| {
            if !c.is_ascii_digit() {
                return c;
            }
            remaining -= 1;
            // Keep the country code digit after a leading '+' and the last four.
            if remaining < 4 || (remaining == digits - 1 && number.starts_with('+')) {
                c
            } else {
                '*'
            }
        })
        .collect()
}
