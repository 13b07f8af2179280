//! Request IDs for server-initiated messages.

use std::sync::Mutex;

/// IDs wrap at this bound to stay short on the wire.
pub const REQUEST_ID_MODULUS: u64 = 999_999;

/// Generates IDs for pushes and pings.
///
/// IDs only disambiguate pushes; they are not used to correlate responses,
/// so repeats after wraparound are harmless.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    prefix: Option<String>,
    counter: Mutex<u64>,
}

impl RequestIdGenerator {
    /// Generator producing bare numbers: "1", "2", ...
    pub fn new() -> Self {
        Self::default()
    }

    /// Generator producing prefixed numbers, e.g. "ping-1".
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            counter: Mutex::new(0),
        }
    }

    /// Next ID in sequence.
    pub fn next_id(&self) -> String {
        let mut counter = self.counter.lock().unwrap_or_else(|e| e.into_inner());
        *counter = (*counter + 1) % REQUEST_ID_MODULUS;
        match &self.prefix {
            Some(prefix) => format!("{}-{}", prefix, *counter),
            None => counter.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequence_starts_at_one() {
        let ids = RequestIdGenerator::new();
        assert_eq!(ids.next_id(), "1");
        assert_eq!(ids.next_id(), "2");
        assert_eq!(ids.next_id(), "3");
    }

    #[test]
    fn test_prefixed_ids() {
        let ids = RequestIdGenerator::with_prefix("ping");
        assert_eq!(ids.next_id(), "ping-1");
        assert_eq!(ids.next_id(), "ping-2");
    }

    #[test]
    fn test_wraps_at_modulus() {
        let ids = RequestIdGenerator::new();
        *ids.counter.lock().unwrap() = REQUEST_ID_MODULUS - 2;

        assert_eq!(ids.next_id(), "999998");
        assert_eq!(ids.next_id(), "0");
        assert_eq!(ids.next_id(), "1");
    }

    #[test]
    fn test_concurrent_ids_are_unique() {
        let ids = Arc::new(RequestIdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..100).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate request ID");
            }
        }
        assert_eq!(seen.len(), 800);
    }
}
