//! Strict round-robin selection over an ordered credential key list.
//!
//! The rotator never consults the governor itself: the caller passes a skip
//! predicate built from the governor's and cache's view, and owns the
//! advance decision (consecutive-use pressure, failures).

use tracing::{debug, warn};

#[derive(Debug)]
pub struct Rotator {
    keys: Vec<String>,
    current: usize,
}

impl Rotator {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys, current: 0 }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_key(&self) -> Option<&str> {
        self.keys.get(self.current).map(String::as_str)
    }

    /// Circular advance; called on rotation pressure or reported failure.
    pub fn advance(&mut self) {
        if !self.keys.is_empty() {
            self.current = (self.current + 1) % self.keys.len();
        }
    }

    /// Point the index at `key` (used when the caller resolved a fallback
    /// candidate outside the plain sweep).
    pub fn focus(&mut self, key: &str) {
        if let Some(index) = self.keys.iter().position(|entry| entry == key) {
            self.current = index;
        }
    }

    /// Keys in sweep order starting from the current index.
    pub fn sweep_order(&self) -> Vec<String> {
        let mut ordered = Vec::with_capacity(self.keys.len());
        for offset in 0..self.keys.len() {
            ordered.push(self.keys[(self.current + offset) % self.keys.len()].clone());
        }
        ordered
    }

    /// Starting at the current index, return the first key the predicate
    /// does not skip. Skipped keys advance the index; a selected key leaves
    /// the index pointing at it (lazy advance). A full fruitless sweep
    /// returns `None`.
    pub fn select_next<F>(&mut self, mut skip: F) -> Option<String>
    where
        F: FnMut(&str) -> bool,
    {
        if self.keys.is_empty() {
            return None;
        }

        let start = self.current;
        let mut tried = 0;
        while tried < self.keys.len() {
            let key = self.keys[self.current].clone();
            if skip(&key) {
                debug!(token_key = %key, "skipping credential in rotation sweep");
                self.advance();
                tried += 1;
                continue;
            }
            debug!(
                token_key = %key,
                current_index = self.current,
                start_index = start,
                "round-robin selected credential"
            );
            return Some(key);
        }

        warn!(total = self.keys.len(), "no credential selectable after full sweep");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotator() -> Rotator {
        Rotator::new(vec!["k0".to_string(), "k1".to_string(), "k2".to_string()])
    }

    #[test]
    fn selection_is_sticky_without_advance() {
        let mut r = rotator();
        assert_eq!(r.select_next(|_| false).as_deref(), Some("k0"));
        assert_eq!(r.select_next(|_| false).as_deref(), Some("k0"));
    }

    #[test]
    fn advance_rotates_in_order() {
        let mut r = rotator();
        assert_eq!(r.select_next(|_| false).as_deref(), Some("k0"));
        r.advance();
        assert_eq!(r.select_next(|_| false).as_deref(), Some("k1"));
        r.advance();
        assert_eq!(r.select_next(|_| false).as_deref(), Some("k2"));
        r.advance();
        assert_eq!(r.select_next(|_| false).as_deref(), Some("k0"));
    }

    #[test]
    fn skipped_keys_are_stepped_over() {
        let mut r = rotator();
        let selected = r.select_next(|key| key == "k0");
        assert_eq!(selected.as_deref(), Some("k1"));
        assert_eq!(r.current_index(), 1);
    }

    #[test]
    fn full_sweep_returns_none() {
        let mut r = rotator();
        assert_eq!(r.select_next(|_| true), None);
        // The index wrapped back to the start after a full sweep.
        assert_eq!(r.current_index(), 0);
    }

    #[test]
    fn empty_list_returns_none() {
        let mut r = Rotator::new(Vec::new());
        assert_eq!(r.select_next(|_| false), None);
        r.advance();
    }

    #[test]
    fn fairness_over_many_selections() {
        let mut r = rotator();
        let mut counts = std::collections::HashMap::new();
        // Model the consecutive-use cap: advance after every selection so
        // the sweep distributes evenly.
        for _ in 0..30 {
            let key = r.select_next(|_| false).unwrap();
            *counts.entry(key).or_insert(0u32) += 1;
            r.advance();
        }
        for key in ["k0", "k1", "k2"] {
            assert_eq!(counts[key], 10);
        }
    }
}
