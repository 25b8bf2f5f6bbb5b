//! Subject naming and pattern matching
//!
//! Subjects are dot-separated tokens: `orders.eu.created`.
//! Tokens must be non-empty and contain no whitespace.
//!
//! Subscription patterns may use wildcards:
//! - `*` matches exactly one token: `orders.*.created` matches `orders.eu.created`
//! - `>` matches one or more trailing tokens and must be last: `orders.>`

use std::fmt;
use thiserror::Error;

/// Validate a single literal token
fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && !token
            .chars()
            .any(|c| c.is_whitespace() || c == '*' || c == '>')
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubjectError {
    #[error("subject cannot be empty")]
    Empty,

    #[error("empty token in subject '{0}'")]
    EmptyToken(String),

    #[error("invalid token '{0}': must be non-empty without whitespace or wildcard characters")]
    InvalidToken(String),

    #[error("wildcards are not allowed in a publish subject")]
    WildcardNotAllowed,

    #[error("'>' can only appear as the last token")]
    TailWildcardNotAtEnd,

    #[error("invalid queue group '{0}': must be non-empty without whitespace")]
    InvalidQueueGroup(String),
}

/// A validated literal subject (no wildcards), used for publishing
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    name: String,
}

impl Subject {
    /// Parse and validate a publish subject
    pub fn parse(name: &str) -> Result<Self, SubjectError> {
        if name.is_empty() {
            return Err(SubjectError::Empty);
        }

        for token in name.split('.') {
            if token.is_empty() {
                return Err(SubjectError::EmptyToken(name.to_string()));
            }

            if token == "*" || token == ">" {
                return Err(SubjectError::WildcardNotAllowed);
            }

            if !is_valid_token(token) {
                return Err(SubjectError::InvalidToken(token.to_string()));
            }
        }

        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Get the subject as a string slice
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Iterate over the tokens
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.name.split('.')
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PatternToken {
    Literal(String),
    /// `*`
    Single,
    /// `>`
    Tail,
}

/// A subscription pattern that may include `*` and a trailing `>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectPattern {
    raw: String,
    tokens: Vec<PatternToken>,
}

impl SubjectPattern {
    /// Parse a subscription pattern
    pub fn parse(pattern: &str) -> Result<Self, SubjectError> {
        if pattern.is_empty() {
            return Err(SubjectError::Empty);
        }

        let parts: Vec<&str> = pattern.split('.').collect();
        let last = parts.len() - 1;
        let mut tokens = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let token = match *part {
                "" => return Err(SubjectError::EmptyToken(pattern.to_string())),
                "*" => PatternToken::Single,
                ">" if i == last => PatternToken::Tail,
                ">" => return Err(SubjectError::TailWildcardNotAtEnd),
                literal if is_valid_token(literal) => PatternToken::Literal(literal.to_string()),
                invalid => return Err(SubjectError::InvalidToken(invalid.to_string())),
            };
            tokens.push(token);
        }

        Ok(Self {
            raw: pattern.to_string(),
            tokens,
        })
    }

    /// Check if this pattern matches a subject
    pub fn matches(&self, subject: &Subject) -> bool {
        let mut subject_tokens = subject.tokens();

        for token in &self.tokens {
            match token {
                PatternToken::Tail => return subject_tokens.next().is_some(),
                PatternToken::Single => {
                    if subject_tokens.next().is_none() {
                        return false;
                    }
                }
                PatternToken::Literal(expected) => match subject_tokens.next() {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                },
            }
        }

        subject_tokens.next().is_none()
    }

    /// Check if this pattern contains any wildcard
    pub fn is_wildcard(&self) -> bool {
        self.tokens
            .iter()
            .any(|t| !matches!(t, PatternToken::Literal(_)))
    }

    /// Get the pattern as a string slice
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Validate a queue group name
pub fn validate_queue_group(group: &str) -> Result<(), SubjectError> {
    if group.is_empty() || group.chars().any(char::is_whitespace) {
        return Err(SubjectError::InvalidQueueGroup(group.to_string()));
    }
    Ok(())
}
