//! Response body rewrite rules.
//!
//! The middleware only parses and stores its rules in the request context;
//! the HTTP engine applies them to the buffered upstream body. Buffering is
//! incompatible with event streams, so on an SSE-flagged context the rules
//! are withheld and the stream passes through untouched.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use crate::config::ConfigMap;
use crate::error::{Error, Result};

use super::{Middleware, RequestContext, REPLACE_RULES_KEY};

/// One compiled rewrite rule.
#[derive(Debug, Clone)]
pub struct ReplaceRule {
    pub pattern: Regex,
    pub replacement: String,
    /// Replace every occurrence instead of just the first.
    pub global: bool,
}

/// Apply rules to a body in declaration order.
pub fn apply_replace_rules(body: &[u8], rules: &[ReplaceRule]) -> Vec<u8> {
    let mut content = String::from_utf8_lossy(body).into_owned();
    for rule in rules {
        content = if rule.global {
            rule.pattern
                .replace_all(&content, rule.replacement.as_str())
                .into_owned()
        } else {
            rule.pattern
                .replace(&content, rule.replacement.as_str())
                .into_owned()
        };
    }
    content.into_bytes()
}

#[derive(Debug)]
pub struct ReplaceMiddleware {
    rules: Arc<Vec<ReplaceRule>>,
}

impl ReplaceMiddleware {
    /// Factory constructor. Config key: `rules`, a list of
    /// `{pattern, replacement, global}` entries. Invalid regexes fail
    /// construction.
    pub fn build(config: Option<&ConfigMap>) -> Result<Arc<dyn Middleware>> {
        let mut rules = Vec::new();
        if let Some(list) = config.and_then(|c| c.get("rules")).and_then(|v| v.as_array()) {
            for entry in list {
                let Some(obj) = entry.as_object() else {
                    continue;
                };
                let pattern = obj.get("pattern").and_then(|v| v.as_str()).unwrap_or("");
                let replacement = obj
                    .get("replacement")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let global = obj.get("global").and_then(|v| v.as_bool()).unwrap_or(false);

                let regex = Regex::new(pattern).map_err(|e| {
                    Error::middleware_config("replace", format!("bad pattern '{pattern}': {e}"))
                })?;
                rules.push(ReplaceRule {
                    pattern: regex,
                    replacement,
                    global,
                });
            }
        }

        Ok(Arc::new(Self {
            rules: Arc::new(rules),
        }))
    }
}

#[async_trait]
impl Middleware for ReplaceMiddleware {
    fn name(&self) -> &str {
        "replace"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> bool {
        if self.rules.is_empty() {
            return true;
        }

        if ctx.sse {
            warn!(
                path = %ctx.path(),
                "Body replacement requires buffering and cannot apply to an event stream"
            );
            return true;
        }

        ctx.set_value(REPLACE_RULES_KEY, self.rules.clone());
        true
    }
}
