//! Transient list of actors barred from joining games.
//!
//! Each entry owns the timer that releases it, so re-excluding an actor that is
//! already excluded keeps the original timer.

use std::collections::HashMap;

use crate::timer::{TimerHandle, TimerToken};

#[derive(Debug, Default)]
pub struct ExclusionList {
    entries: HashMap<String, TimerHandle>,
}

impl ExclusionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Excludes `user_id`, arming its release timer with `arm`. Returns false
    /// (and does not call `arm`) if the actor is already excluded.
    pub fn exclude<F>(&mut self, user_id: &str, arm: F) -> bool
    where
        F: FnOnce() -> TimerHandle,
    {
        if self.entries.contains_key(user_id) {
            return false;
        }
        self.entries.insert(user_id.to_string(), arm());
        true
    }

    /// Releases `user_id` if `token` belongs to its current release timer.
    pub fn expire(&mut self, user_id: &str, token: TimerToken) -> bool {
        let current = self
            .entries
            .get(user_id)
            .map(|timer| timer.matches(token))
            .unwrap_or(false);
        if current {
            self.entries.remove(user_id);
        }
        current
    }

    pub fn is_excluded(&self, user_id: &str) -> bool {
        self.entries.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::schedule;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_exclude_is_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel::<TimerToken>();
        let mut list = ExclusionList::new();

        assert!(list.exclude("u1", || schedule(Duration::from_secs(60), &tx, |t| t)));
        let mut armed_again = false;
        assert!(!list.exclude("u1", || {
            armed_again = true;
            schedule(Duration::from_secs(60), &tx, |t| t)
        }));

        assert!(!armed_again);
        assert!(list.is_excluded("u1"));
        assert_eq!(list.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_requires_current_token() {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerToken>();
        let mut list = ExclusionList::new();
        list.exclude("u1", || schedule(Duration::from_secs(1), &tx, |t| t));

        assert!(!list.expire("u1", 0));
        assert!(list.is_excluded("u1"));

        let token = rx.recv().await.unwrap();
        assert!(list.expire("u1", token));
        assert!(!list.is_excluded("u1"));
        assert!(!list.expire("u1", token));
        assert!(list.is_empty());
    }
}
