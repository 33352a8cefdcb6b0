//! Subject names and wildcard patterns.
//!
//! Subjects are hierarchical, dot-delimited token strings
//! (`GMSEC.MISSION.SAT1.MSG.HB`). Subscription patterns may use `*` to
//! match exactly one token and `>` (terminal only) to match one or more
//! remaining tokens.

use crate::status::{Result, Status, StatusClass, StatusCode};
use std::fmt;
use std::str::FromStr;

/// One element of a subject pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Element {
    Literal(String),
    /// `*` — exactly one token.
    AnyToken,
    /// `>` — one or more remaining tokens; must be the last element.
    Remaining,
}

fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '%')
}

/// Validate a concrete (send-side) subject: non-empty, well-formed
/// tokens, no wildcards.
pub fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty() {
        return Err(Status::new(
            StatusClass::MsgError,
            StatusCode::InvalidSubjectName,
            "Subject cannot be empty",
        ));
    }
    for token in subject.split('.') {
        if !is_valid_token(token) {
            return Err(Status::new(
                StatusClass::MsgError,
                StatusCode::InvalidSubjectName,
                format!("Invalid subject: {subject}"),
            ));
        }
    }
    Ok(())
}

/// A parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    elements: Vec<Element>,
}

impl Pattern {
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Whether the given concrete subject matches this pattern.
    ///
    /// `*` consumes exactly one token; `>` consumes the rest but requires
    /// at least one token to remain. `A.>` therefore matches `A.B` and
    /// `A.B.C` but not `A`.
    pub fn matches(&self, subject: &str) -> bool {
        let mut tokens = subject.split('.');

        for element in &self.elements {
            match element {
                Element::Remaining => return tokens.next().is_some(),
                Element::AnyToken => {
                    if tokens.next().is_none() {
                        return false;
                    }
                }
                Element::Literal(literal) => match tokens.next() {
                    Some(token) if token == literal => {}
                    _ => return false,
                },
            }
        }

        tokens.next().is_none()
    }
}

impl FromStr for Pattern {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            Status::new(
                StatusClass::MsgError,
                StatusCode::InvalidSubjectName,
                format!("Invalid subject pattern: {s}"),
            )
        };

        if s.is_empty() {
            return Err(invalid());
        }

        let raw: Vec<&str> = s.split('.').collect();
        let mut elements = Vec::with_capacity(raw.len());

        for (pos, token) in raw.iter().enumerate() {
            let element = match *token {
                "*" => Element::AnyToken,
                ">" => {
                    if pos != raw.len() - 1 {
                        return Err(invalid());
                    }
                    Element::Remaining
                }
                literal => {
                    if !is_valid_token(literal) {
                        return Err(invalid());
                    }
                    Element::Literal(literal.to_string())
                }
            };
            elements.push(element);
        }

        Ok(Pattern { elements })
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pos, element) in self.elements.iter().enumerate() {
            if pos > 0 {
                f.write_str(".")?;
            }
            match element {
                Element::Literal(literal) => f.write_str(literal)?,
                Element::AnyToken => f.write_str("*")?,
                Element::Remaining => f.write_str(">")?,
            }
        }
        Ok(())
    }
}
