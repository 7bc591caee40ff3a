//! Conversation states and the pure transition function.

use serde::Serialize;

use crate::error::InvalidTransition;

/// Where one participant is in the standup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    AwaitingReadiness,
    AwaitingYesterday,
    AwaitingToday,
    AwaitingFinishTime,
    AwaitingBlockers,
    Complete,
}

/// What happened at the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// "yes" at the readiness gate.
    Ready,
    /// "no" at the readiness gate.
    Declined,
    /// An answer to one of the four standup questions.
    Answered(String),
}

impl ConversationState {
    /// All states, in question order.
    pub const ALL: [ConversationState; 6] = [
        Self::AwaitingReadiness,
        Self::AwaitingYesterday,
        Self::AwaitingToday,
        Self::AwaitingFinishTime,
        Self::AwaitingBlockers,
        Self::Complete,
    ];

    /// Apply `step`, returning the next state. Never touches `self`.
    pub fn next(self, step: &Step) -> Result<Self, InvalidTransition> {
        use ConversationState::*;
        match (self, step) {
            (AwaitingReadiness, Step::Ready) => Ok(AwaitingYesterday),
            (AwaitingReadiness, Step::Declined) => Ok(Complete),
            (AwaitingYesterday, Step::Answered(_)) => Ok(AwaitingToday),
            (AwaitingToday, Step::Answered(_)) => Ok(AwaitingFinishTime),
            (AwaitingFinishTime, Step::Answered(_)) => Ok(AwaitingBlockers),
            (AwaitingBlockers, Step::Answered(_)) => Ok(Complete),
            (from, step) => Err(InvalidTransition {
                from,
                step: step.clone(),
            }),
        }
    }

    /// Whether `to` is a declared edge out of this state.
    pub fn has_edge_to(self, to: ConversationState) -> bool {
        [Step::Ready, Step::Declined, Step::Answered(String::new())]
            .iter()
            .any(|step| self.next(step) == Ok(to))
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Complete
    }

    /// The question asked in this state; `None` once complete.
    pub fn question(self) -> Option<&'static str> {
        match self {
            Self::AwaitingReadiness => Some(questions::READY),
            Self::AwaitingYesterday => Some(questions::YESTERDAY),
            Self::AwaitingToday => Some(questions::TODAY),
            Self::AwaitingFinishTime => Some(questions::FINISH_TIME),
            Self::AwaitingBlockers => Some(questions::BLOCKERS),
            Self::Complete => None,
        }
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingReadiness => write!(f, "awaiting readiness"),
            Self::AwaitingYesterday => write!(f, "awaiting yesterday"),
            Self::AwaitingToday => write!(f, "awaiting today"),
            Self::AwaitingFinishTime => write!(f, "awaiting finish time"),
            Self::AwaitingBlockers => write!(f, "awaiting blockers"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Readiness answer: `Some(true)` for yes, `Some(false)` for no.
pub fn parse_readiness(answer: &str) -> Option<bool> {
    let answer = answer.trim();
    if answer.eq_ignore_ascii_case("yes") {
        Some(true)
    } else if answer.eq_ignore_ascii_case("no") {
        Some(false)
    } else {
        None
    }
}

pub mod questions {
    pub const READY: &str =
        "Hey :) are you ready for standup? If you are say Yes. If you aren't taking part today say No.";
    pub const CLARIFY: &str = "Sorry, I didn't understand that, please say yes or no.";
    pub const YESTERDAY: &str = "Let's get started, what did you get done yesterday?";
    pub const TODAY: &str = "Awesome, what are you working on today?";
    pub const FINISH_TIME: &str = "Great, when do you think you'll be finished with that?";
    pub const BLOCKERS: &str = "Is there anything blocking you or that could block you?";
    pub const DONE: &str = "Thanks, have a great day!";
}
