//! Command priority map.
//!
//! Read at enqueue time, mutable at runtime through the supervisor's
//! `set_priority` / `remove_priority` commands. Commands without an
//! entry run at priority 0.

use parking_lot::RwLock;
use std::collections::HashMap;

/// Mutable command-name to priority mapping.
#[derive(Debug)]
pub struct PriorityMap {
    entries: RwLock<HashMap<String, i64>>,
}

impl Default for PriorityMap {
    fn default() -> Self {
        let mut entries = HashMap::new();
        entries.insert("check_code".to_string(), 0);
        entries.insert("run".to_string(), 0);
        entries.insert("compile".to_string(), 1);
        entries.insert("remove".to_string(), 1);
        Self {
            entries: RwLock::new(entries),
        }
    }
}

impl PriorityMap {
    /// Priority of a command; unknown commands run at 0.
    #[must_use]
    pub fn get(&self, command: &str) -> i64 {
        self.entries.read().get(command).copied().unwrap_or(0)
    }

    /// Sets or replaces a command's priority.
    pub fn set(&self, command: impl Into<String>, priority: i64) {
        self.entries.write().insert(command.into(), priority);
    }

    /// Removes a command's entry; returns how many entries were
    /// removed (0 or 1).
    pub fn remove(&self, command: &str) -> usize {
        usize::from(self.entries.write().remove(command).is_some())
    }

    /// All entries, sorted by command name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort();
        entries
    }
}
