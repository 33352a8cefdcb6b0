//! Inbound message filters: duplicate suppression and subject exclusion.

use crate::message::Message;
use crate::status::Result;
use crate::subject::Pattern;
use std::collections::{HashSet, VecDeque};

/// Default number of recently-seen unique IDs retained.
pub const DEFAULT_UNIQUE_WINDOW: usize = 250;

/// Bounded LRU of seen message IDs.
///
/// The only input is the UNIQUE-ID tracking field; a message without one
/// bypasses the filter entirely and is always delivered.
#[derive(Debug)]
pub struct UniqueFilter {
    window: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl UniqueFilter {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            order: VecDeque::with_capacity(window.max(1)),
            seen: HashSet::with_capacity(window.max(1)),
        }
    }

    /// Record an ID. Returns `true` if it had not been seen within the
    /// window (the message is fresh), `false` for a duplicate.
    pub fn update(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.window {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for UniqueFilter {
    fn default() -> Self {
        Self::new(DEFAULT_UNIQUE_WINDOW)
    }
}

/// Wildcard subject matcher that drops unwanted inbound traffic without
/// touching the driver-level subscriptions.
#[derive(Debug, Default)]
pub struct ExclusionFilter {
    patterns: Vec<Pattern>,
}

impl ExclusionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude_subject(&mut self, pattern: &str) -> Result<()> {
        let parsed: Pattern = pattern.parse()?;
        if !self.patterns.contains(&parsed) {
            self.patterns.push(parsed);
        }
        Ok(())
    }

    /// Returns whether the pattern was present.
    pub fn remove_excluded_subject(&mut self, pattern: &str) -> Result<bool> {
        let parsed: Pattern = pattern.parse()?;
        let before = self.patterns.len();
        self.patterns.retain(|p| *p != parsed);
        Ok(self.patterns.len() != before)
    }

    /// True when the message's subject matches any excluded pattern.
    pub fn check_for_exclusion(&self, msg: &Message) -> bool {
        self.is_subject_excluded(msg.subject())
    }

    pub fn is_subject_excluded(&self, subject: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(subject))
    }
}
