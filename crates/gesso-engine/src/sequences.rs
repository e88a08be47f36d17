use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

/// Composite key for one sequence cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeqKey {
    pub kind: &'static str,
    pub discriminant: String,
}

impl SeqKey {
    pub fn new(kind: &'static str, discriminant: impl Into<String>) -> Self {
        Self {
            kind,
            discriminant: discriminant.into(),
        }
    }

    /// Key for a wildcard-backed sequence. The options hash
    /// invalidates the cursor when the underlying file changes.
    pub fn for_wildcard(name: &str, options: &[String]) -> Self {
        Self::new("wc", format!("{name}_{}", options_hash(options)))
    }
}

#[derive(Debug, Clone)]
struct SequenceCursor {
    values: Vec<String>,
    next_index: usize,
    just_ran: bool,
}

/// Keyed cursor table shared across the prompt-like fields of a
/// request and across requests. One coarse mutex; entries are small
/// and every operation is O(1).
#[derive(Debug, Default)]
pub struct SequenceStore {
    inner: Mutex<HashMap<SeqKey, SequenceCursor>>,
}

impl SequenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next value without advancing. Does not initialize or mark the
    /// cursor as used.
    pub fn peek(&self, key: &SeqKey) -> Option<String> {
        let table = self.inner.lock().ok()?;
        let cursor = table.get(key)?;
        if cursor.values.is_empty() {
            return None;
        }
        Some(cursor.values[cursor.next_index % cursor.values.len()].clone())
    }

    /// Advance the cursor, lazily initializing it from `init` on
    /// first use. Returns `None` when the value list is empty.
    pub fn advance(
        &self,
        key: SeqKey,
        init: impl FnOnce() -> Vec<String>,
    ) -> Option<String> {
        let mut table = self.inner.lock().ok()?;
        let cursor = table.entry(key).or_insert_with(|| SequenceCursor {
            values: init(),
            next_index: 0,
            just_ran: false,
        });
        if cursor.values.is_empty() {
            return None;
        }
        let value = cursor.values[cursor.next_index % cursor.values.len()].clone();
        cursor.next_index += 1;
        cursor.just_ran = true;
        Some(value)
    }

    /// Called at the start of each request's preparse.
    pub fn clear_ran_flags(&self) {
        if let Ok(mut table) = self.inner.lock() {
            for cursor in table.values_mut() {
                cursor.just_ran = false;
            }
        }
    }

    /// Called at the end of preparse: sequences the request never
    /// touched are forgotten.
    pub fn gc_stale(&self) {
        if let Ok(mut table) = self.inner.lock() {
            table.retain(|_, cursor| cursor.just_ran);
        }
    }

    pub fn contains(&self, key: &SeqKey) -> bool {
        self.inner
            .lock()
            .map(|table| table.contains_key(key))
            .unwrap_or(false)
    }
}

fn options_hash(options: &[String]) -> String {
    let mut hasher = Sha256::new();
    for option in options {
        hasher.update(option.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc() -> Vec<String> {
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    }

    #[test]
    fn advance_wraps_and_peek_does_not_move() {
        let store = SequenceStore::new();
        let key = SeqKey::new("seq", "a|b|c");

        assert_eq!(store.advance(key.clone(), abc).as_deref(), Some("a"));
        assert_eq!(store.peek(&key).as_deref(), Some("b"));
        assert_eq!(store.peek(&key).as_deref(), Some("b"));
        assert_eq!(store.advance(key.clone(), abc).as_deref(), Some("b"));
        assert_eq!(store.advance(key.clone(), abc).as_deref(), Some("c"));
        assert_eq!(store.advance(key, abc).as_deref(), Some("a"));
    }

    #[test]
    fn peek_on_uninitialized_key_is_none() {
        let store = SequenceStore::new();
        assert_eq!(store.peek(&SeqKey::new("seq", "x")), None);
    }

    #[test]
    fn gc_removes_sequences_the_request_never_ran() {
        let store = SequenceStore::new();
        let used = SeqKey::new("seq", "used");
        let stale = SeqKey::new("seq", "stale");
        store.advance(used.clone(), abc);
        store.advance(stale.clone(), abc);

        store.clear_ran_flags();
        store.advance(used.clone(), abc);
        store.gc_stale();

        assert!(store.contains(&used));
        assert!(!store.contains(&stale));
    }

    #[test]
    fn empty_value_list_yields_none() {
        let store = SequenceStore::new();
        assert_eq!(store.advance(SeqKey::new("seq", "e"), Vec::new), None);
    }

    #[test]
    fn wildcard_key_tracks_option_content() {
        let a = SeqKey::for_wildcard("colors", &abc());
        let b = SeqKey::for_wildcard("colors", &abc());
        let changed = SeqKey::for_wildcard("colors", &["a".to_string()]);
        assert_eq!(a, b);
        assert_ne!(a, changed);
    }
}
