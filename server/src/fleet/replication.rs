//! Counting handshake that decides when a (re)connected member has replayed
//! its full game list into the directory.
//!
//! Replicated games and the member's "expected count" arrive in any order, so
//! completion is detected from both sides: when a replica brings the observed
//! count up to the expected one, or when the expected count is declared and
//! already matches (or is zero). A finish-check timeout force-completes the
//! session and a detach before completion stops it.

use std::fmt;

use super::member::MemberRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationPhase {
    Active,
    Complete,
    StoppedEarly,
}

/// How a finished session reached completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationOutcome {
    Natural,
    Forced,
}

impl fmt::Display for ReplicationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationOutcome::Natural => f.write_str("natural"),
            ReplicationOutcome::Forced => f.write_str("forced"),
        }
    }
}

/// Result of counting one replication-origin game event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaOutcome {
    Counted,
    /// This replica made the session complete.
    Completed,
    /// A replica arrived after completion; it is not counted.
    AfterCompletion,
    /// The session was stopped; nothing is counted any more.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ReplicationSession {
    observed: Option<u32>,
    expected: Option<u32>,
    expected_declared: bool,
    phase: ReplicationPhase,
}

impl Default for ReplicationSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationSession {
    pub fn new() -> Self {
        Self {
            observed: Some(0),
            expected: None,
            expected_declared: false,
            phase: ReplicationPhase::Active,
        }
    }

    pub fn phase(&self) -> ReplicationPhase {
        self.phase
    }

    /// `None` once the counters were frozen by a forced completion.
    pub fn observed(&self) -> Option<u32> {
        self.observed
    }

    pub fn expected(&self) -> Option<u32> {
        self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.phase == ReplicationPhase::Complete
    }

    pub fn record_replica(&mut self) -> ReplicaOutcome {
        match self.phase {
            ReplicationPhase::Complete => ReplicaOutcome::AfterCompletion,
            ReplicationPhase::StoppedEarly => ReplicaOutcome::Ignored,
            ReplicationPhase::Active => {
                let observed = self.observed.unwrap_or(0) + 1;
                self.observed = Some(observed);
                if self.expected == Some(observed) {
                    self.phase = ReplicationPhase::Complete;
                    ReplicaOutcome::Completed
                } else {
                    ReplicaOutcome::Counted
                }
            }
        }
    }

    /// Stores the member's expected count. Returns true if this completed the
    /// session. Only the first declaration counts.
    pub fn declare_expected(&mut self, count: u32) -> bool {
        if self.expected_declared || self.phase != ReplicationPhase::Active {
            return false;
        }
        self.expected_declared = true;
        self.expected = Some(count);

        if count == 0 || self.observed == Some(count) {
            self.phase = ReplicationPhase::Complete;
            return true;
        }
        false
    }

    pub fn expected_declared(&self) -> bool {
        self.expected_declared
    }

    /// Completes an active session regardless of its counters.
    ///
    /// Returns the `(observed, expected)` pair at the time of forcing so it can
    /// be logged, or `None` if the session was no longer active.
    pub fn force_complete(&mut self) -> Option<(Option<u32>, Option<u32>)> {
        if self.phase != ReplicationPhase::Active {
            return None;
        }
        let counters = (self.observed, self.expected);
        self.observed = None;
        self.expected = None;
        self.phase = ReplicationPhase::Complete;
        Some(counters)
    }

    /// Ends the session on detach. Returns true if it was still incomplete.
    pub fn stop(&mut self) -> bool {
        if self.phase == ReplicationPhase::Active {
            self.phase = ReplicationPhase::StoppedEarly;
            true
        } else {
            false
        }
    }
}

/// Lifecycle notifications emitted by a member's replication session.
pub trait ReplicationHooks: Send + Sync {
    fn replication_started(&self, member: &MemberRef);
    fn replication_finished(&self, member: &MemberRef, outcome: ReplicationOutcome);
    /// The member detached before replication completed; its games are partial.
    fn replication_stopped(&self, member: &MemberRef);
}
