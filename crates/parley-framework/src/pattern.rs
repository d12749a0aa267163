//! Pattern compilation for route matching.
//!
//! A route pattern is one of:
//!
//! - the wildcard token `*`, matching any non-empty input
//! - a phrase with placeholders, e.g. `order {id}` or `say {text}`
//! - a literal phrase, e.g. `/start`
//!
//! Matching trims the input and ignores case. The whole input must match.
//!
//! # Placeholders
//!
//! | Placeholder | Captures |
//! |---|---|
//! | `{id}`, `{user}`, `{amount}` | digits |
//! | `{name}` | one word (`[A-Za-z0-9_]+`, Unicode aware) |
//! | `{text}`, `{any}` | the rest of the input, at least one character |
//!
//! ```rust,ignore
//! let pattern = Pattern::compile("order {id}")?;
//! let params = pattern.matches("Order 42").unwrap();
//! assert_eq!(params["id"], "42");
//! ```

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};

use crate::error::{PatternError, PatternResult};

/// The wildcard pattern token.
pub const WILDCARD: &str = "*";

/// Returns the capture expression for a known placeholder.
fn placeholder_class(name: &str) -> Option<&'static str> {
    match name {
        "id" | "user" | "amount" => Some(r"\d+"),
        "name" => Some(r"\w+"),
        "text" | "any" => Some(r".+"),
        _ => None,
    }
}

/// Prepares raw input for matching.
pub fn normalize(input: &str) -> &str {
    input.trim()
}

#[derive(Debug, Clone)]
enum Matcher {
    Wildcard,
    Expr { regex: Regex, names: Vec<String> },
}

/// A single compiled pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    matcher: Matcher,
}

impl Pattern {
    /// Compiles a pattern.
    ///
    /// Literal text is escaped before placeholders are substituted, and the
    /// result is anchored to the whole input.
    pub fn compile(source: &str) -> PatternResult<Self> {
        let trimmed = source.trim();
        if trimmed == WILDCARD {
            return Ok(Self {
                source: source.to_string(),
                matcher: Matcher::Wildcard,
            });
        }

        let mut expr = String::with_capacity(trimmed.len() + 16);
        let mut names = Vec::new();
        expr.push('^');

        let mut rest = trimmed;
        while let Some(open) = rest.find('{') {
            expr.push_str(&regex::escape(&rest[..open]));
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| PatternError::UnclosedPlaceholder {
                    pattern: source.to_string(),
                })?;
            let name = &after[..close];
            let class = placeholder_class(name).ok_or_else(|| PatternError::UnknownPlaceholder {
                pattern: source.to_string(),
                name: name.to_string(),
            })?;

            expr.push_str(&format!("(?P<{name}>{class})"));
            names.push(name.to_string());
            rest = &after[close + 1..];
        }
        expr.push_str(&regex::escape(rest));
        expr.push('$');

        let regex = RegexBuilder::new(&expr)
            .case_insensitive(true)
            .build()
            .map_err(|source_err| PatternError::Invalid {
                pattern: source.to_string(),
                source: source_err,
            })?;

        Ok(Self {
            source: source.to_string(),
            matcher: Matcher::Expr { regex, names },
        })
    }

    /// The pattern as authored.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self.matcher, Matcher::Wildcard)
    }

    /// Tests `input` and returns the extracted parameters on a match.
    pub fn matches(&self, input: &str) -> Option<HashMap<String, String>> {
        let input = normalize(input);
        match &self.matcher {
            Matcher::Wildcard => (!input.is_empty()).then(HashMap::new),
            Matcher::Expr { regex, names } => {
                let caps = regex.captures(input)?;
                Some(
                    names
                        .iter()
                        .filter_map(|name| {
                            caps.name(name)
                                .map(|m| (name.clone(), m.as_str().to_string()))
                        })
                        .collect(),
                )
            }
        }
    }
}

/// A successful match against a [`PatternSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    /// The pattern that matched, as authored.
    pub pattern: String,
    pub params: HashMap<String, String>,
}

/// The compiled alternatives of one route.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    /// Compiles every alternative, failing on the first invalid one.
    pub fn compile<S: AsRef<str>>(sources: &[S]) -> PatternResult<Self> {
        let patterns = sources
            .iter()
            .map(|s| Pattern::compile(s.as_ref()))
            .collect::<PatternResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Returns the first alternative that matches, in declaration order.
    pub fn find(&self, input: &str) -> Option<PatternMatch> {
        self.patterns.iter().find_map(|p| {
            p.matches(input).map(|params| PatternMatch {
                pattern: p.as_str().to_string(),
                params,
            })
        })
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
