//! Per-session output batching.
//!
//! The coalescer only keeps buffers; the supervisor owns the clock. The
//! first push into an empty buffer returns a generation number and the
//! caller arms one flush timer for it. A timer whose generation no longer
//! matches (because the buffer was flushed or cancelled in the meantime)
//! finds nothing to take.

use std::collections::HashMap;

use crate::registry::SessionId;

#[derive(Debug)]
struct Pending {
    data: String,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct OutputCoalescer {
    pending: HashMap<SessionId, Pending>,
    last_generation: u64,
}

impl OutputCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk`. Returns the generation to arm a flush timer for when
    /// this push started a new batch.
    pub fn push(&mut self, id: &SessionId, chunk: &str) -> Option<u64> {
        if chunk.is_empty() {
            return None;
        }
        if let Some(pending) = self.pending.get_mut(id) {
            pending.data.push_str(chunk);
            return None;
        }
        self.last_generation += 1;
        let generation = self.last_generation;
        self.pending.insert(
            id.clone(),
            Pending {
                data: chunk.to_string(),
                generation,
            },
        );
        Some(generation)
    }

    /// Takes the batch a timer was armed for.
    pub fn take_due(&mut self, id: &SessionId, generation: u64) -> Option<String> {
        match self.pending.get(id) {
            Some(pending) if pending.generation == generation => {
                self.pending.remove(id).map(|pending| pending.data)
            }
            _ => None,
        }
    }

    /// Takes whatever is buffered, ahead of its timer.
    pub fn flush_now(&mut self, id: &SessionId) -> Option<String> {
        self.pending.remove(id).map(|pending| pending.data)
    }

    /// Drops whatever is buffered. Returns whether anything was.
    pub fn cancel(&mut self, id: &SessionId) -> bool {
        self.pending.remove(id).is_some()
    }

    #[cfg(test)]
    fn has_pending(&self, id: &SessionId) -> bool {
        self.pending.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn only_first_push_arms_a_timer() {
        let mut coalescer = OutputCoalescer::new();
        let id = SessionId::from("s");
        let generation = coalescer.push(&id, "a").expect("first push arms");
        assert_eq!(coalescer.push(&id, "b"), None);
        assert_eq!(coalescer.push(&id, "c"), None);
        assert_eq!(coalescer.take_due(&id, generation), Some("abc".to_string()));
        assert!(!coalescer.has_pending(&id));
    }

    #[test]
    fn stale_timer_takes_nothing() {
        let mut coalescer = OutputCoalescer::new();
        let id = SessionId::from("s");
        let stale = coalescer.push(&id, "before exit").expect("arms");
        assert_eq!(coalescer.flush_now(&id), Some("before exit".to_string()));

        let fresh = coalescer.push(&id, "after").expect("re-arms");
        assert_ne!(stale, fresh);
        assert_eq!(coalescer.take_due(&id, stale), None);
        assert_eq!(coalescer.take_due(&id, fresh), Some("after".to_string()));
    }

    #[test]
    fn cancel_discards_buffer() {
        let mut coalescer = OutputCoalescer::new();
        let id = SessionId::from("s");
        let generation = coalescer.push(&id, "lost").expect("arms");
        assert!(coalescer.cancel(&id));
        assert!(!coalescer.cancel(&id));
        assert_eq!(coalescer.take_due(&id, generation), None);
        assert_eq!(coalescer.flush_now(&id), None);
    }

    #[test]
    fn sessions_batch_independently() {
        let mut coalescer = OutputCoalescer::new();
        let a = SessionId::from("a");
        let b = SessionId::from("b");
        let ga = coalescer.push(&a, "1").expect("a arms");
        let gb = coalescer.push(&b, "2").expect("b arms");
        assert_eq!(coalescer.take_due(&a, gb), None);
        assert_eq!(coalescer.take_due(&b, gb), Some("2".to_string()));
        assert_eq!(coalescer.take_due(&a, ga), Some("1".to_string()));
    }

    #[test]
    fn empty_chunks_are_ignored() {
        let mut coalescer = OutputCoalescer::new();
        let id = SessionId::from("s");
        assert_eq!(coalescer.push(&id, ""), None);
        assert!(!coalescer.has_pending(&id));
    }
}
