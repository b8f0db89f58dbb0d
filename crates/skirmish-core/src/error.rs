//! Error types for skirmish-core

use crate::{identity::MsgType, message::{ExtraTag, Phase}, value::ValueType};
use thiserror::Error;

/// Core error type
///
/// These are configuration errors (programmer misuse) and the runaway-chain
/// abort. Expected per-message results (stop, skip, re-input) are not errors;
/// they travel as [`crate::Outcome`] values in handler replies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid entity: {0}")]
    InvalidEntity(String),

    #[error("Cannot register {phase} for '{kind}': MAIN is not registered")]
    UnregisteredPrerequisite { kind: MsgType, phase: Phase },

    #[error("Not registered: {0}")]
    NotRegistered(String),

    #[error("Invalid message phase: {0}")]
    InvalidPhase(Phase),

    #[error("Extra '{tag}': expected {expected}, got {got}")]
    TypeMismatch {
        tag: ExtraTag,
        expected: ValueType,
        got: &'static str,
    },

    #[error("Runaway chain: {count} messages against a limit of {limit}")]
    RunawayChain { count: usize, limit: usize },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
