//! Host pattern matching.
//!
//! Three pattern shapes are supported, in decreasing precedence:
//! exact hostname, `*.domain` wildcard, and anchored regex (`^...$`).
//! A wildcard `*.domain` matches both `domain` itself and any subdomain.

use regex::Regex;

use crate::error::{Error, Result};

/// A compiled host pattern.
#[derive(Debug, Clone)]
pub enum HostPattern {
    Exact(String),
    /// Stores the domain without the leading `*.`.
    Wildcard(String),
    Regex(Regex),
}

impl HostPattern {
    /// Parse a pattern string into its compiled form.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an anchored pattern that is not a
    /// valid regex.
    pub fn parse(pattern: &str) -> Result<Self> {
        if let Some(domain) = pattern.strip_prefix("*.") {
            return Ok(Self::Wildcard(domain.to_string()));
        }
        if pattern.starts_with('^') && pattern.ends_with('$') {
            let re = Regex::new(pattern)
                .map_err(|e| Error::config(format!("invalid host pattern '{pattern}': {e}")))?;
            return Ok(Self::Regex(re));
        }
        Ok(Self::Exact(pattern.to_string()))
    }

    /// Whether this pattern matches the given host (port already stripped).
    pub fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == host,
            Self::Wildcard(domain) => {
                host == domain || host.ends_with(&format!(".{domain}"))
            }
            Self::Regex(re) => re.is_match(host),
        }
    }

    /// Precedence class: lower ranks win. Exact beats wildcard beats regex.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Exact(_) => 0,
            Self::Wildcard(_) => 1,
            Self::Regex(_) => 2,
        }
    }
}

/// Strip an optional `:port` suffix from a Host header value.
pub fn strip_port(host: &str) -> &str {
    // IPv6 literals keep their brackets; only split on the last colon when
    // it follows the closing bracket or there are no brackets at all.
    if let Some(end) = host.rfind(']') {
        match host[end..].find(':') {
            Some(idx) => &host[..end + idx],
            None => host,
        }
    } else {
        host.split(':').next().unwrap_or(host)
    }
}
