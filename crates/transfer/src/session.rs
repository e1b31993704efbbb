//! Part and multipart-session state machines.
//!
//! ```text
//! Part:     Pending ──► InFlight ──► Completed
//!              ▲            │
//!              └── Failed ◄─┘   (back to Pending only when a retry is allowed)
//!
//! Session:  Initiating ──► Active ──► Completing ──► Completed
//!                            │            │
//!                            └────────────┴──► Aborting ──► Aborted
//! ```
//!
//! Both machines are owned by the coordinating task and change only there.
//! Workers report `PartEvent`s over a channel; nothing here is shared or locked.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::planner::PartSpec;
use crate::traits::{CompletedPart, SessionToken};
use crate::types::ByteRange;

/// Rejected state transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Unknown part {index}")]
    UnknownPart { index: u32 },

    #[error("Part {index} cannot move from {from:?} to {to:?}")]
    InvalidPartTransition {
        index: u32,
        from: PartState,
        to: PartState,
    },

    #[error("Session cannot move from {from:?} to {to:?}")]
    InvalidSessionTransition { from: SessionState, to: SessionState },

    #[error("Session cannot complete: part {index} is {state:?}")]
    IncompletePart { index: u32, state: PartState },
}

// ============================================================================
// Parts
// ============================================================================

/// Lifecycle of one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Pending,
    InFlight,
    Completed,
    Failed,
}

/// A part and its progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRecord {
    pub index: u32,
    pub range: ByteRange,
    pub state: PartState,
    /// Attempts started so far.
    pub attempts: u32,
    /// Entity tag, once completed. Empty for downloads.
    pub e_tag: Option<String>,
}

/// Records for every part of a plan, indexed by part number.
#[derive(Debug, Clone, Default)]
pub struct PartTable {
    parts: BTreeMap<u32, PartRecord>,
}

impl PartTable {
    /// Table with every part `Pending`.
    pub fn new(parts: &[PartSpec]) -> Self {
        let parts: BTreeMap<u32, PartRecord> = parts
            .iter()
            .map(|p| {
                (
                    p.index,
                    PartRecord {
                        index: p.index,
                        range: p.range,
                        state: PartState::Pending,
                        attempts: 0,
                        e_tag: None,
                    },
                )
            })
            .collect();
        Self { parts }
    }

    pub fn get(&self, index: u32) -> Option<&PartRecord> {
        self.parts.get(&index)
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Parts in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = &PartRecord> {
        self.parts.values()
    }

    fn record_mut(&mut self, index: u32) -> Result<&mut PartRecord, SessionError> {
        self.parts
            .get_mut(&index)
            .ok_or(SessionError::UnknownPart { index })
    }

    fn transition(&mut self, index: u32, from: PartState, to: PartState) -> Result<&mut PartRecord, SessionError> {
        let record = self.record_mut(index)?;
        if record.state != from {
            return Err(SessionError::InvalidPartTransition {
                index,
                from: record.state,
                to,
            });
        }
        record.state = to;
        Ok(record)
    }

    /// `Pending → InFlight`, counting one attempt.
    pub fn start(&mut self, index: u32) -> Result<(), SessionError> {
        let record = self.transition(index, PartState::Pending, PartState::InFlight)?;
        record.attempts += 1;
        Ok(())
    }

    /// `InFlight → Completed`.
    pub fn complete(&mut self, index: u32, e_tag: Option<String>) -> Result<(), SessionError> {
        let record = self.transition(index, PartState::InFlight, PartState::Completed)?;
        record.e_tag = e_tag;
        Ok(())
    }

    /// `InFlight → Failed`.
    pub fn fail(&mut self, index: u32) -> Result<(), SessionError> {
        self.transition(index, PartState::InFlight, PartState::Failed)
            .map(|_| ())
    }

    /// `Failed → Pending`, when the retry policy allows another attempt.
    pub fn requeue(&mut self, index: u32) -> Result<(), SessionError> {
        self.transition(index, PartState::Failed, PartState::Pending)
            .map(|_| ())
    }

    pub fn count(&self, state: PartState) -> usize {
        self.parts.values().filter(|p| p.state == state).count()
    }

    pub fn all_completed(&self) -> bool {
        self.parts.values().all(|p| p.state == PartState::Completed)
    }

    /// Lowest-indexed part that is not `Completed`.
    pub fn first_incomplete(&self) -> Option<&PartRecord> {
        self.parts.values().find(|p| p.state != PartState::Completed)
    }

    /// Completion list in ascending part order.
    ///
    /// Fails unless every part is `Completed` with an entity tag.
    pub fn completed_parts(&self) -> Result<Vec<CompletedPart>, SessionError> {
        self.parts
            .values()
            .map(|p| match (&p.state, &p.e_tag) {
                (PartState::Completed, Some(e_tag)) => Ok(CompletedPart {
                    part_number: p.index,
                    e_tag: e_tag.clone(),
                }),
                _ => Err(SessionError::IncompletePart {
                    index: p.index,
                    state: p.state,
                }),
            })
            .collect()
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Lifecycle of a remote multipart session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initiating,
    Active,
    Completing,
    Completed,
    Aborting,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }

    /// Whether parts may still be dispatched.
    pub fn accepts_parts(&self) -> bool {
        *self == SessionState::Active
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A multipart upload or copy session and its parts.
#[derive(Debug, Clone)]
pub struct MultipartSession {
    token: Option<SessionToken>,
    state: SessionState,
    parts: PartTable,
}

impl MultipartSession {
    /// Session in `Initiating` for the given parts.
    pub fn new(parts: &[PartSpec]) -> Self {
        Self {
            token: None,
            state: SessionState::Initiating,
            parts: PartTable::new(parts),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn token(&self) -> Option<&SessionToken> {
        self.token.as_ref()
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.upload_id.as_str())
    }

    pub fn parts(&self) -> &PartTable {
        &self.parts
    }

    /// Part table, mutable only while the session accepts parts.
    pub fn parts_mut(&mut self) -> &mut PartTable {
        &mut self.parts
    }

    fn transition(&mut self, allowed_from: &[SessionState], to: SessionState) -> Result<(), SessionError> {
        if !allowed_from.contains(&self.state) {
            return Err(SessionError::InvalidSessionTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// `Initiating → Active` once the store issued an upload id.
    pub fn activate(&mut self, token: SessionToken) -> Result<(), SessionError> {
        self.transition(&[SessionState::Initiating], SessionState::Active)?;
        self.token = Some(token);
        Ok(())
    }

    /// `Active → Completing`, returning the ordered completion list.
    ///
    /// Fails, leaving the state unchanged, unless every part is `Completed`.
    pub fn begin_completing(&mut self) -> Result<Vec<CompletedPart>, SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::InvalidSessionTransition {
                from: self.state,
                to: SessionState::Completing,
            });
        }
        let parts: Vec<CompletedPart> = self.parts.completed_parts()?;
        self.state = SessionState::Completing;
        Ok(parts)
    }

    /// `Completing → Completed`.
    pub fn mark_completed(&mut self) -> Result<(), SessionError> {
        self.transition(&[SessionState::Completing], SessionState::Completed)
    }

    /// `Active | Completing → Aborting`. No part may be dispatched afterwards.
    pub fn begin_aborting(&mut self) -> Result<(), SessionError> {
        self.transition(
            &[SessionState::Active, SessionState::Completing],
            SessionState::Aborting,
        )
    }

    /// `Aborting → Aborted`, whether or not the store confirmed the abort.
    pub fn mark_aborted(&mut self) -> Result<(), SessionError> {
        self.transition(&[SessionState::Aborting], SessionState::Aborted)
    }
}
