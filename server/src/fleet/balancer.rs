//! Contract with the external placement balancer.
//!
//! The registry keeps the balancer consistent with member lifecycle: a member
//! is added when it enters rotation, updated while it stays there and removed
//! when it leaves. Calls are fire-and-forget; failures are logged by the
//! registry and never abort a transition.

use log::info;
use shared::{LoadLevel, MemberState};
use std::sync::Mutex;
use thiserror::Error;

use super::member::MemberRef;

#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("member {0} is not known to the balancer")]
    UnknownMember(String),
    #[error("balancer rejected update: {0}")]
    Rejected(String),
}

pub trait PlacementBalancer: Send + Sync {
    fn add_member(
        &self,
        member: &MemberRef,
        level: LoadLevel,
        priority: u8,
    ) -> Result<(), BalancerError>;

    fn update_member(
        &self,
        member: &MemberRef,
        level: LoadLevel,
        priority: u8,
        state: MemberState,
    ) -> Result<(), BalancerError>;

    fn remove_member(&self, member: &MemberRef, priority: u8) -> Result<(), BalancerError>;
}

/// Balancer used by the standalone binary: records placement decisions in the log.
#[derive(Debug, Default)]
pub struct LoggingBalancer;

impl PlacementBalancer for LoggingBalancer {
    fn add_member(
        &self,
        member: &MemberRef,
        level: LoadLevel,
        priority: u8,
    ) -> Result<(), BalancerError> {
        info!("Balancer: add {} at {} (priority {})", member, level, priority);
        Ok(())
    }

    fn update_member(
        &self,
        member: &MemberRef,
        level: LoadLevel,
        priority: u8,
        state: MemberState,
    ) -> Result<(), BalancerError> {
        info!(
            "Balancer: update {} to {} (priority {}, {:?})",
            member, level, priority, state
        );
        Ok(())
    }

    fn remove_member(&self, member: &MemberRef, priority: u8) -> Result<(), BalancerError> {
        info!("Balancer: remove {} (priority {})", member, priority);
        Ok(())
    }
}

/// One call observed by `RecordingBalancer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalancerCall {
    Add(MemberRef, LoadLevel),
    Update(MemberRef, LoadLevel, MemberState),
    Remove(MemberRef),
}

/// Balancer that keeps every call, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingBalancer {
    calls: Mutex<Vec<BalancerCall>>,
    fail: bool,
}

impl RecordingBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records calls but reports every one of them as failed.
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<BalancerCall> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, call: BalancerCall) -> Result<(), BalancerError> {
        let name = match &call {
            BalancerCall::Add(member, _)
            | BalancerCall::Update(member, _, _)
            | BalancerCall::Remove(member) => member.to_string(),
        };
        match self.calls.lock() {
            Ok(mut calls) => calls.push(call),
            Err(poisoned) => poisoned.into_inner().push(call),
        }
        if self.fail {
            Err(BalancerError::Rejected(name))
        } else {
            Ok(())
        }
    }
}

impl PlacementBalancer for RecordingBalancer {
    fn add_member(
        &self,
        member: &MemberRef,
        level: LoadLevel,
        _priority: u8,
    ) -> Result<(), BalancerError> {
        self.record(BalancerCall::Add(member.clone(), level))
    }

    fn update_member(
        &self,
        member: &MemberRef,
        level: LoadLevel,
        _priority: u8,
        state: MemberState,
    ) -> Result<(), BalancerError> {
        self.record(BalancerCall::Update(member.clone(), level, state))
    }

    fn remove_member(&self, member: &MemberRef, _priority: u8) -> Result<(), BalancerError> {
        self.record(BalancerCall::Remove(member.clone()))
    }
}
