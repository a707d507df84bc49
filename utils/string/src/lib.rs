//! POSIX shell quoting helpers.
//!
//! Every token that ends up inside a command string handed to `sh -c`, a
//! login shell's startup command, or a remote session's input stream goes
//! through these helpers. Single-quote wrapping is used exclusively: inside
//! single quotes a POSIX shell performs no expansion at all, so the only
//! character that needs care is the single quote itself.

use std::borrow::Cow;

/// Wraps `value` in single quotes, escaping embedded single quotes as `'\''`.
///
/// The result always parses back to exactly `value` as one shell word.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// True when `value` can appear as a bare shell word without quoting.
pub fn is_shell_safe(value: &str) -> bool {
    !value.is_empty()
        && value.chars().all(|ch| {
            ch.is_ascii_alphanumeric()
                || matches!(ch, '_' | '-' | '.' | '/' | ':' | '=' | '@' | '%' | '+' | ',')
        })
}

/// Returns `value` unchanged when it is a safe bare word, quoted otherwise.
pub fn quote_if_needed(value: &str) -> Cow<'_, str> {
    if is_shell_safe(value) {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(shell_quote(value))
    }
}

/// Wraps `value` in PowerShell single quotes, doubling embedded quotes.
pub fn powershell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Like [`quote_if_needed`] but for a PowerShell command line.
pub fn powershell_quote_if_needed(value: &str) -> Cow<'_, str> {
    if is_shell_safe(value) {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(powershell_quote(value))
    }
}
