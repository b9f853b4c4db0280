//! URL path pattern matching.
//!
//! Same three-way shape as host patterns: exact path, `prefix/*`
//! (matches the prefix itself and anything under it), and anchored regex.

use regex::Regex;

use crate::error::{Error, Result};

/// A compiled path pattern.
#[derive(Debug, Clone)]
pub enum PathPattern {
    Exact(String),
    /// Stores the prefix without the trailing `/*`.
    Prefix(String),
    Regex(Regex),
}

impl PathPattern {
    /// Parse a pattern string into its compiled form.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an anchored pattern that is not a
    /// valid regex.
    pub fn parse(pattern: &str) -> Result<Self> {
        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Ok(Self::Prefix(prefix.to_string()));
        }
        if pattern.starts_with('^') && pattern.ends_with('$') {
            let re = Regex::new(pattern)
                .map_err(|e| Error::config(format!("invalid path pattern '{pattern}': {e}")))?;
            return Ok(Self::Regex(re));
        }
        Ok(Self::Exact(pattern.to_string()))
    }

    /// Whether this pattern matches the given request path.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == path,
            Self::Prefix(prefix) => {
                path == prefix || path.starts_with(&format!("{prefix}/"))
            }
            Self::Regex(re) => re.is_match(path),
        }
    }

    /// Precedence class: lower ranks win. Exact beats prefix beats regex.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Exact(_) => 0,
            Self::Prefix(_) => 1,
            Self::Regex(_) => 2,
        }
    }
}
