//! Error types for the standup engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::conversation::{ConversationState, Step};

/// Failures talking to the chat platform.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Why a single question could not be answered.
///
/// Every variant ends the advancement of the one conversation that hit it;
/// none of them abort the run.
#[derive(Debug, Error)]
pub enum AskError {
    /// The question could not be delivered.
    #[error("failed to send question: {0}")]
    SendFailed(#[source] TransportError),

    /// A reply from the participant carried a timestamp we could not parse.
    #[error("malformed inbound event: {0}")]
    ReceiveMalformed(String),

    /// Nobody answered inside the per-question window.
    #[error("no answer within {0:?}")]
    Timeout(Duration),

    /// The run ended (deadline or quorum) while we were waiting.
    #[error("run cancelled while waiting for an answer")]
    Cancelled,

    /// The readiness gate never got a yes or no.
    #[error("no yes/no answer after {attempts} clarifications (last answer: {last:?})")]
    UnrecognizedReadinessAnswer { attempts: u32, last: String },

    /// Another question is already outstanding for this participant.
    #[error("a question is already pending for {0}")]
    Busy(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

/// A step was applied to a state that has no edge for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no transition from {from:?} on {step:?}")]
pub struct InvalidTransition {
    pub from: ConversationState,
    pub step: Step,
}

/// Problems loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bad config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid time of day {0:?} (expected HH:MM)")]
    TimeOfDay(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}
