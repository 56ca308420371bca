//! # Failure Detail Sanitization
//!
//! Raw auth failures routinely echo tokens, cookies and addresses back in
//! their messages. Everything stored in [`ClassifiedError::detail`] passes
//! through [`sanitize_message`] first.
//!
//! [`ClassifiedError::detail`]: crate::types::ClassifiedError::detail

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

const REDACTED: &str = "[REDACTED]";

static JWT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"eyJ[a-zA-Z0-9\-_]+\.eyJ[a-zA-Z0-9\-_]+\.[a-zA-Z0-9\-_]+").expect("valid JWT pattern")
});

static BEARER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(bearer)\s+[a-zA-Z0-9._\-]+").expect("valid bearer pattern"));

static KEY_VALUE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(api[_-]?key|access[_-]?token|refresh[_-]?token|token|secret|password|credential|cookie)s?["']?\s*[=:]\s*["']?[^"'\s;,]+"#,
    )
    .expect("valid key/value pattern")
});

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("valid email pattern")
});

/// Removes credentials, JWTs and email addresses from a failure message
pub fn sanitize_message(message: &str) -> String {
    let sanitized = JWT_PATTERN.replace_all(message, REDACTED);
    let sanitized = BEARER_PATTERN.replace_all(&sanitized, |caps: &Captures| {
        format!("{} {}", &caps[1], REDACTED)
    });
    let sanitized = KEY_VALUE_PATTERN.replace_all(&sanitized, |caps: &Captures| {
        format!("{}={}", &caps[1], REDACTED)
    });
    EMAIL_PATTERN.replace_all(&sanitized, REDACTED).into_owned()
}
