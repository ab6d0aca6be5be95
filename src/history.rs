//! Raw-input history and fuzzy reverse search
//!
//! The history index is an ordered sequence of raw input lines, persisted to
//! a plain text file; it never participates in the semantic memory index.
//! Reverse search is an explicit state machine (pattern buffer, cursor,
//! direction) so the walk-and-stop behavior is testable without a terminal:
//! each repeated search with the same pattern advances to the next older
//! match, and running off the oldest entry yields `NoMatch` with no cyclic
//! wraparound.

use crate::error::Result;
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Ordered raw-input history, newest last
pub struct HistoryIndex {
    entries: Vec<String>,
    file: Option<PathBuf>,
    max_entries: usize,
}

impl HistoryIndex {
    /// Volatile index with no backing file
    pub fn in_memory(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            file: None,
            max_entries,
        }
    }

    /// Load the index from its backing file, creating the file lazily
    pub fn load(path: &Path, max_entries: usize) -> Result<Self> {
        let mut entries = Vec::new();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            entries = content
                .lines()
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
            // Keep only the newest window
            if entries.len() > max_entries {
                entries.drain(..entries.len() - max_entries);
            }
        }
        Ok(Self {
            entries,
            file: Some(path.to_path_buf()),
            max_entries,
        })
    }

    /// Append one input line; consecutive duplicates and blanks are skipped
    pub fn append(&mut self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() || self.entries.last().map(String::as_str) == Some(line) {
            return Ok(());
        }

        self.entries.push(line.to_string());
        if self.entries.len() > self.max_entries {
            self.entries.remove(0);
        }

        if let Some(path) = &self.file {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Prefix completions over history, newest first, deduplicated
    pub fn complete(&self, prefix: &str) -> Vec<String> {
        if prefix.is_empty() {
            return Vec::new();
        }
        let mut seen = std::collections::HashSet::new();
        self.entries
            .iter()
            .rev()
            .filter(|e| e.starts_with(prefix))
            .filter(|e| seen.insert(e.as_str()))
            .take(10)
            .cloned()
            .collect()
    }
}

/// Walk direction for history search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchDirection {
    /// Newest to oldest (reverse search, the default)
    Backward,
    /// Oldest to newest from the current position
    Forward,
}

/// Result of one search step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Matching entry and its index in the history
    Match { index: usize, entry: String },
    /// Walk exhausted; repeated invocations stay here (no wraparound)
    NoMatch,
}

/// Interactive search state machine over a `HistoryIndex`
pub struct HistorySearch {
    pattern: String,
    direction: SearchDirection,
    /// Next index to examine; None before the first step or after exhaustion
    cursor: Option<usize>,
    exhausted: bool,
    matcher: SkimMatcherV2,
}

impl HistorySearch {
    pub fn new() -> Self {
        Self {
            pattern: String::new(),
            direction: SearchDirection::Backward,
            cursor: None,
            exhausted: false,
            matcher: SkimMatcherV2::default(),
        }
    }

    /// Set the pattern; a changed pattern restarts the walk from the end
    pub fn set_pattern(&mut self, pattern: &str) {
        if pattern != self.pattern {
            self.pattern = pattern.to_string();
            self.cursor = None;
            self.exhausted = false;
        }
    }

    pub fn set_direction(&mut self, direction: SearchDirection) {
        if direction != self.direction {
            self.direction = direction;
            self.cursor = None;
            self.exhausted = false;
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Advance one step: first invocation returns the most recent match,
    /// repeats return successively older ones, exhaustion is terminal.
    pub fn step(&mut self, index: &HistoryIndex) -> SearchOutcome {
        if self.exhausted || self.pattern.is_empty() || index.is_empty() {
            return SearchOutcome::NoMatch;
        }

        match self.direction {
            SearchDirection::Backward => self.step_backward(index),
            SearchDirection::Forward => self.step_forward(index),
        }
    }

    fn step_backward(&mut self, index: &HistoryIndex) -> SearchOutcome {
        let start = match self.cursor {
            Some(c) => c,
            None => index.len() - 1,
        };

        let mut i = start as isize;
        while i >= 0 {
            let entry = &index.entries()[i as usize];
            if self.matches(entry) {
                // Park the cursor one older; running off index zero makes
                // the next step exhaust instead of wrapping to the newest.
                if i == 0 {
                    self.exhausted = true;
                } else {
                    self.cursor = Some((i - 1) as usize);
                }
                return SearchOutcome::Match {
                    index: i as usize,
                    entry: entry.clone(),
                };
            }
            i -= 1;
        }

        self.exhausted = true;
        SearchOutcome::NoMatch
    }

    fn step_forward(&mut self, index: &HistoryIndex) -> SearchOutcome {
        let start = self.cursor.unwrap_or(0);

        for i in start..index.len() {
            let entry = &index.entries()[i];
            if self.matches(entry) {
                if i + 1 >= index.len() {
                    self.exhausted = true;
                } else {
                    self.cursor = Some(i + 1);
                }
                return SearchOutcome::Match {
                    index: i,
                    entry: entry.clone(),
                };
            }
        }

        self.exhausted = true;
        SearchOutcome::NoMatch
    }

    fn matches(&self, entry: &str) -> bool {
        // Substring first (cheap and exact), fuzzy second so misspelled
        // patterns still surface matches
        entry.contains(&self.pattern)
            || self.matcher.fuzzy_match(entry, &self.pattern).is_some()
    }
}

impl Default for HistorySearch {
    fn default() -> Self {
        Self::new()
    }
}
