//! In-flight batch registry.
//!
//! Each sent frame carries a handle; the table maps that handle to the
//! ordered continuations of the calls inside the frame, so the
//! demultiplexer can pair replies with callers.
//!
//! Handles count *down* from `u32::MAX` with wraparound. Zero is never
//! allocated (the server uses a zero handle for its own notifications),
//! and a handle still occupied by a live batch is skipped rather than
//! reused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::packet::Continuation;

/// Table of batches awaiting a response, keyed by frame handle.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<u32, Vec<Option<Continuation>>>>,
    next_handle: AtomicU32,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            // First fetch_sub yields 0, wrapping_sub makes the first
            // allocated handle u32::MAX.
            next_handle: AtomicU32::new(0),
        }
    }

    /// Register a batch and return its freshly allocated handle.
    pub(crate) fn register(&self, continuations: Vec<Option<Continuation>>) -> u32 {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let handle = self
                .next_handle
                .fetch_sub(1, Ordering::Relaxed)
                .wrapping_sub(1);
            if handle == 0 || entries.contains_key(&handle) {
                continue;
            }
            entries.insert(handle, continuations);
            return handle;
        }
    }

    /// Remove and return the continuations registered under `handle`.
    pub(crate) fn remove(&self, handle: u32) -> Option<Vec<Option<Continuation>>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle)
    }

    /// Number of batches still awaiting a response.
    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Drop every registered batch, returning how many were discarded.
    /// Used when the stream is reset and outstanding replies can never
    /// arrive.
    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = entries.len();
        entries.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Option<Continuation> {
        Some(Box::new(|_| {}))
    }

    #[test]
    fn test_handles_count_down_from_max() {
        let table = PendingTable::new();
        assert_eq!(table.register(vec![noop()]), u32::MAX);
        assert_eq!(table.register(vec![noop()]), u32::MAX - 1);
        assert_eq!(table.register(vec![noop()]), u32::MAX - 2);
    }

    #[test]
    fn test_remove_returns_continuations_once() {
        let table = PendingTable::new();
        let handle = table.register(vec![noop(), noop()]);
        assert_eq!(table.len(), 1);

        let conts = table.remove(handle).unwrap();
        assert_eq!(conts.len(), 2);
        assert!(table.remove(handle).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_occupied_handle_is_skipped() {
        let table = PendingTable::new();
        let first = table.register(vec![noop()]);
        assert_eq!(first, u32::MAX);

        // Force the counter all the way around so the next allocation
        // would land on the still-occupied first handle.
        table.next_handle.store(0, Ordering::Relaxed);
        let second = table.register(vec![noop()]);
        assert_eq!(second, u32::MAX - 1);
    }

    #[test]
    fn test_zero_is_never_allocated() {
        let table = PendingTable::new();
        // Position the counter so the next allocation would yield 0.
        table.next_handle.store(1, Ordering::Relaxed);
        let handle = table.register(vec![noop()]);
        assert_ne!(handle, 0);
        assert_eq!(handle, u32::MAX);
    }

    #[test]
    fn test_clear_reports_dropped_count() {
        let table = PendingTable::new();
        table.register(vec![noop()]);
        table.register(vec![noop()]);
        assert_eq!(table.clear(), 2);
        assert_eq!(table.len(), 0);
    }
}
