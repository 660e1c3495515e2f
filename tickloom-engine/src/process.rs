//! Process identity
//!
//! Interned, immutable process identifiers. Repeated `ProcessId::of` calls
//! with the same name observe the same numeric suffix; equality, ordering and
//! hashing go by name. The intern table is the only process-wide mutable
//! state in the runtime.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde::de::{Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

static INTERN: OnceLock<DashMap<Arc<str>, u64>> = OnceLock::new();
static NEXT_NUM: AtomicU64 = AtomicU64::new(1);

fn intern_table() -> &'static DashMap<Arc<str>, u64> {
    INTERN.get_or_init(DashMap::new)
}

/// An interned process identifier: a human-readable name plus the monotonic
/// numeric suffix assigned at first interning.
#[derive(Clone)]
pub struct ProcessId {
    name: Arc<str>,
    num: u64,
}

impl ProcessId {
    /// Intern `name` and return its stable identity. Concurrent interning of
    /// distinct names is safe; the same name always resolves to the same
    /// numeric suffix.
    pub fn of(name: &str) -> Self {
        let table = intern_table();
        if let Some(entry) = table.get(name) {
            return ProcessId {
                name: entry.key().clone(),
                num: *entry.value(),
            };
        }
        let entry = table
            .entry(Arc::from(name))
            .or_insert_with(|| NEXT_NUM.fetch_add(1, Ordering::Relaxed));
        ProcessId {
            name: entry.key().clone(),
            num: *entry.value(),
        }
    }

    /// The human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The numeric suffix assigned at first interning.
    pub fn num(&self) -> u64 {
        self.num
    }
}

impl PartialEq for ProcessId {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ProcessId {}

impl PartialOrd for ProcessId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProcessId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

impl Hash for ProcessId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.num)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Serialize for ProcessId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

struct ProcessIdVisitor;

impl Visitor<'_> for ProcessIdVisitor {
    type Value = ProcessId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a process name")
    }

    fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<ProcessId, E> {
        Ok(ProcessId::of(value))
    }
}

impl<'de> Deserialize<'de> for ProcessId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(ProcessIdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_stable() {
        let a = ProcessId::of("athens");
        let b = ProcessId::of("athens");
        assert_eq!(a, b);
        assert_eq!(a.num(), b.num());
    }

    #[test]
    fn test_distinct_names_get_distinct_numbers() {
        let a = ProcessId::of("byzantium");
        let b = ProcessId::of("cyrene");
        assert_ne!(a, b);
        assert_ne!(a.num(), b.num());
    }

    #[test]
    fn test_equality_is_by_name() {
        let a = ProcessId::of("delphi");
        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(a.name(), "delphi");
    }

    #[test]
    fn test_serde_round_trip_preserves_identity() {
        let a = ProcessId::of("ephesus");
        let bytes = serde_json::to_vec(&a).unwrap();
        let back: ProcessId = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(a, back);
        assert_eq!(a.num(), back.num());
    }

    #[test]
    fn test_concurrent_interning_assigns_one_number_per_name() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| ProcessId::of("contended").num()))
            .collect();
        let nums: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(nums.windows(2).all(|w| w[0] == w[1]));
    }
}
