//! Validation and quoting of values written into SSH files
//!
//! Container aliases, host names and user names end up inside a shared
//! `~/.ssh/config` and `known_hosts`. A value carrying whitespace, a newline
//! or a pattern character would inject extra directives or widen a trust
//! pattern, so everything is checked before rendering.

use crate::error::{DevboxError, Result};

/// Maximum length for aliases, host names and user names
pub const MAX_NAME_CHARS: usize = 253;

/// Characters with special meaning in ssh_config / known_hosts patterns
const PATTERN_CHARS: &[char] = &['*', '?', '!', ',', '#', '"', '\'', '=', '[', ']'];

/// Validate a container alias used as a `Host` name and certificate principal
///
/// # Examples
/// ```
/// use devbox_ssh::ssh::sanitize::validate_alias;
///
/// assert_eq!(validate_alias("  dev-foo ").unwrap(), "dev-foo");
/// assert!(validate_alias("dev foo").is_err());
/// assert!(validate_alias("dev-*").is_err());
/// ```
pub fn validate_alias(alias: &str) -> Result<&str> {
    validate_name("Alias", alias, PATTERN_CHARS)
}

/// Validate a remote host name or IP address (without port)
///
/// IPv6 literals are accepted, so `:` is allowed here; brackets are not.
pub fn validate_host(host: &str) -> Result<&str> {
    validate_name("Host", host, PATTERN_CHARS)
}

/// Validate a login user name
pub fn validate_user(user: &str) -> Result<&str> {
    validate_name("User", user, PATTERN_CHARS)
}

/// Validate a container-alias wildcard for known_hosts (e.g. `dev-*`)
///
/// Wildcards are allowed; list separators, negation and whitespace are not.
pub fn validate_alias_pattern(pattern: &str) -> Result<&str> {
    validate_name("Alias pattern", pattern, &[',', '!', '#', '"', '\'', '='])
}

fn validate_name<'a>(what: &str, value: &'a str, forbidden: &[char]) -> Result<&'a str> {
    let trimmed = value.trim();

    if trimmed.is_empty() {
        return Err(DevboxError::invalid_params(format!(
            "{} cannot be empty",
            what
        )));
    }

    if trimmed.len() > MAX_NAME_CHARS {
        return Err(DevboxError::invalid_params(format!(
            "{} is too long (max {} characters, got {})",
            what,
            MAX_NAME_CHARS,
            trimmed.len()
        )));
    }

    if let Some(c) = trimmed
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || forbidden.contains(c))
    {
        return Err(DevboxError::invalid_params(format!(
            "{} {:?} contains forbidden character {:?}",
            what, trimmed, c
        )));
    }

    Ok(trimmed)
}

/// Quote a value for ssh_config if it contains whitespace
///
/// # Example
/// ```
/// use devbox_ssh::ssh::sanitize::quote_config_value;
///
/// assert_eq!(quote_config_value("/home/dev/known_hosts"), "/home/dev/known_hosts");
/// assert_eq!(
///     quote_config_value("/Users/Jane Doe/.devbox/known_hosts"),
///     "\"/Users/Jane Doe/.devbox/known_hosts\""
/// );
/// ```
pub fn quote_config_value(value: &str) -> String {
    if value.chars().any(char::is_whitespace) {
        format!("\"{}\"", value)
    } else {
        value.to_string()
    }
}
