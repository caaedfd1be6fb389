//! Rolling transcript of the remote side's speech.

use crate::config::TranscriptConfig;
use std::collections::VecDeque;

/// Ordered text fragments in arrival order, rotated so the joined text stays short
/// enough for a single caption line.
#[derive(Debug, Clone)]
pub struct Transcript {
    fragments: VecDeque<String>,
    max_chars: usize,
    max_fragments: usize,
}

impl Transcript {
    pub fn new(config: &TranscriptConfig) -> Self {
        Self {
            fragments: VecDeque::new(),
            max_chars: config.max_chars,
            max_fragments: config.max_fragments.max(1),
        }
    }

    /// Append a fragment. Empty/whitespace fragments are ignored. The newest fragment
    /// is always retained, even when it alone exceeds `max_chars`.
    pub fn push(&mut self, fragment: &str) {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return;
        }
        self.fragments.push_back(fragment.to_string());

        while self.fragments.len() > self.max_fragments
            || (self.fragments.len() > 1 && self.joined_len() > self.max_chars)
        {
            self.fragments.pop_front();
        }
    }

    /// Fragments joined by a single space.
    pub fn text(&self) -> String {
        self.fragments
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn fragments(&self) -> Vec<String> {
        self.fragments.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }

    fn joined_len(&self) -> usize {
        let chars: usize = self.fragments.iter().map(|f| f.chars().count()).sum();
        chars + self.fragments.len().saturating_sub(1)
    }
}
