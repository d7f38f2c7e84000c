//! Request-scoped memoization of idempotent tool calls.

use super::tools::ToolOutput;
use std::collections::HashMap;

/// Tool results keyed by `ToolCall::memo_key()`. Lives for one request only.
#[derive(Debug, Default)]
pub struct MemoCache {
    entries: HashMap<String, ToolOutput>,
    hits: usize,
}

impl MemoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, key: &str) -> Option<&ToolOutput> {
        let found = self.entries.get(key);
        if found.is_some() {
            self.hits += 1;
        }
        found
    }

    /// Only successful outputs are stored; failures stay retryable.
    pub fn insert(&mut self, key: String, value: ToolOutput) {
        self.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }
}
