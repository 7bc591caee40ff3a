//! One participant's standup, as a state machine.
//!
//! A [`Conversation`] is fully built before its task starts and is owned by
//! that task alone: only the owner calls [`Conversation::advance`], so
//! transitions for one participant are strictly sequential.

mod state;

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::correlator::Asker;
use crate::error::{AskError, InvalidTransition};
use crate::transport::Participant;

pub use state::{ConversationState, Step, parse_readiness, questions};

/// What happens when the readiness gate never gets a yes or no.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessFallback {
    /// Take the "no" edge.
    #[default]
    Decline,
    /// Give up on the participant for the day.
    Stall,
}

/// Bounds on the readiness clarification loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub max_clarifications: u32,
    pub fallback: ReadinessFallback,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_clarifications: 3,
            fallback: ReadinessFallback::Decline,
        }
    }
}

/// Run-wide limits passed to every [`Conversation::advance`] call.
#[derive(Debug, Clone)]
pub struct AdvanceContext {
    pub question_timeout: Duration,
    pub deadline: Instant,
    pub readiness: ReadinessPolicy,
    pub cancel: CancellationToken,
}

impl AdvanceContext {
    /// The per-question wait, clipped to what is left of the run.
    pub fn wait(&self) -> Duration {
        self.question_timeout
            .min(self.deadline.saturating_duration_since(Instant::now()))
    }
}

/// The four standup answers. Each is set exactly when its state is left.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Answers {
    pub yesterday: Option<String>,
    pub today: Option<String>,
    pub finish_time: Option<String>,
    pub blockers: Option<String>,
}

impl Answers {
    pub fn is_empty(&self) -> bool {
        self.yesterday.is_none()
            && self.today.is_none()
            && self.finish_time.is_none()
            && self.blockers.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    participant: Participant,
    state: ConversationState,
    answers: Answers,
}

impl Conversation {
    pub fn new(participant: Participant) -> Self {
        Self {
            participant,
            state: ConversationState::AwaitingReadiness,
            answers: Answers::default(),
        }
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn answers(&self) -> &Answers {
        &self.answers
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_terminal()
    }

    /// Said "no" at the readiness gate.
    pub fn is_declined(&self) -> bool {
        self.is_complete() && self.answers.blockers.is_none()
    }

    /// Apply one step, storing the answer for the state being left.
    pub fn apply(&mut self, step: Step) -> Result<ConversationState, InvalidTransition> {
        let next = self.state.next(&step)?;
        let field = match self.state {
            ConversationState::AwaitingYesterday => Some(&mut self.answers.yesterday),
            ConversationState::AwaitingToday => Some(&mut self.answers.today),
            ConversationState::AwaitingFinishTime => Some(&mut self.answers.finish_time),
            ConversationState::AwaitingBlockers => Some(&mut self.answers.blockers),
            ConversationState::AwaitingReadiness | ConversationState::Complete => None,
        };
        if let (Step::Answered(text), Some(field)) = (step, field) {
            *field = Some(text);
        }
        self.state = next;
        Ok(next)
    }

    /// Ask the current state's question and take one step on the answer.
    ///
    /// On error nothing changes; the caller stops advancing this
    /// conversation for the rest of the run.
    pub async fn advance(
        &mut self,
        asker: &dyn Asker,
        ctx: &AdvanceContext,
    ) -> Result<ConversationState, AskError> {
        let step = match self.state {
            ConversationState::Complete => return Ok(self.state),
            ConversationState::AwaitingReadiness => self.ask_readiness(asker, ctx).await?,
            state => {
                let question = state.question().unwrap_or_default();
                let answer = asker
                    .ask(&self.participant.id, question, ctx.wait(), &ctx.cancel)
                    .await?;
                Step::Answered(answer)
            }
        };

        let from = self.state;
        let to = self.apply(step)?;
        tracing::debug!(participant = %self.participant.id, %from, %to, "Advanced");
        Ok(to)
    }

    async fn ask_readiness(&self, asker: &dyn Asker, ctx: &AdvanceContext) -> Result<Step, AskError> {
        let id = &self.participant.id;
        let mut question = questions::READY;
        let mut clarifications = 0u32;

        loop {
            let answer = asker.ask(id, question, ctx.wait(), &ctx.cancel).await?;
            match parse_readiness(&answer) {
                Some(true) => return Ok(Step::Ready),
                Some(false) => return Ok(Step::Declined),
                None if clarifications < ctx.readiness.max_clarifications => {
                    clarifications += 1;
                    tracing::debug!(participant = %id, answer = %answer, clarifications, "Readiness answer not understood");
                    question = questions::CLARIFY;
                }
                None => match ctx.readiness.fallback {
                    ReadinessFallback::Decline => {
                        tracing::info!(participant = %id, answer = %answer, "No yes/no after clarifications, treating as declined");
                        return Ok(Step::Declined);
                    }
                    ReadinessFallback::Stall => {
                        return Err(AskError::UnrecognizedReadinessAnswer {
                            attempts: clarifications,
                            last: answer,
                        });
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ParticipantId;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Answers from a fixed queue and records every question asked.
    #[derive(Default)]
    struct QueueAsker {
        answers: Mutex<VecDeque<Result<String, AskError>>>,
        asked: Mutex<Vec<String>>,
    }

    impl QueueAsker {
        fn with(answers: &[&str]) -> Self {
            let asker = Self::default();
            asker
                .answers
                .lock()
                .extend(answers.iter().map(|a| Ok(a.to_string())));
            asker
        }

        fn asked(&self) -> Vec<String> {
            self.asked.lock().clone()
        }
    }

    #[async_trait]
    impl Asker for QueueAsker {
        async fn ask(
            &self,
            _participant: &ParticipantId,
            question: &str,
            wait: Duration,
            _cancel: &CancellationToken,
        ) -> Result<String, AskError> {
            self.asked.lock().push(question.to_string());
            self.answers
                .lock()
                .pop_front()
                .unwrap_or(Err(AskError::Timeout(wait)))
        }

        async fn tell(&self, _participant: &ParticipantId, _text: &str) -> Result<(), AskError> {
            Ok(())
        }
    }

    fn ctx(readiness: ReadinessPolicy) -> AdvanceContext {
        AdvanceContext {
            question_timeout: Duration::from_secs(60),
            deadline: Instant::now() + Duration::from_secs(3600),
            readiness,
            cancel: CancellationToken::new(),
        }
    }

    async fn drive(conv: &mut Conversation, asker: &QueueAsker, ctx: &AdvanceContext) -> Option<AskError> {
        while !conv.is_complete() {
            if let Err(e) = conv.advance(asker, ctx).await {
                return Some(e);
            }
        }
        None
    }

    #[tokio::test]
    async fn full_standup_fills_every_answer() {
        let asker = QueueAsker::with(&["Yes", "fixed the build", "release notes", "by 3pm", "none"]);
        let mut conv = Conversation::new(Participant::member("alice"));
        assert!(drive(&mut conv, &asker, &ctx(ReadinessPolicy::default())).await.is_none());

        assert_eq!(conv.state(), ConversationState::Complete);
        assert!(!conv.is_declined());
        let a = conv.answers();
        assert_eq!(a.yesterday.as_deref(), Some("fixed the build"));
        assert_eq!(a.today.as_deref(), Some("release notes"));
        assert_eq!(a.finish_time.as_deref(), Some("by 3pm"));
        assert_eq!(a.blockers.as_deref(), Some("none"));
        assert_eq!(
            asker.asked(),
            vec![
                questions::READY,
                questions::YESTERDAY,
                questions::TODAY,
                questions::FINISH_TIME,
                questions::BLOCKERS
            ]
        );
    }

    #[tokio::test]
    async fn no_in_any_case_declines_with_empty_answers() {
        for no in ["no", "NO", "  No  "] {
            let asker = QueueAsker::with(&[no]);
            let mut conv = Conversation::new(Participant::member("bob"));
            let state = conv.advance(&asker, &ctx(ReadinessPolicy::default())).await.unwrap();
            assert_eq!(state, ConversationState::Complete);
            assert!(conv.is_declined());
            assert!(conv.answers().is_empty());
        }
    }

    #[tokio::test]
    async fn unclear_readiness_reasks_without_advancing() {
        let asker = QueueAsker::with(&["maybe", "what?", "yes"]);
        let mut conv = Conversation::new(Participant::member("carol"));
        let state = conv.advance(&asker, &ctx(ReadinessPolicy::default())).await.unwrap();
        assert_eq!(state, ConversationState::AwaitingYesterday);
        assert_eq!(
            asker.asked(),
            vec![questions::READY, questions::CLARIFY, questions::CLARIFY]
        );
        assert!(conv.answers().is_empty());
    }

    #[tokio::test]
    async fn exhausted_clarifications_decline_by_default() {
        let asker = QueueAsker::with(&["hm", "eh", "huh", "dunno"]);
        let mut conv = Conversation::new(Participant::member("dan"));
        let state = conv.advance(&asker, &ctx(ReadinessPolicy::default())).await.unwrap();
        assert_eq!(state, ConversationState::Complete);
        assert!(conv.is_declined());
        assert_eq!(asker.asked().len(), 4);
    }

    #[tokio::test]
    async fn exhausted_clarifications_can_stall() {
        let asker = QueueAsker::with(&["hm", "eh"]);
        let policy = ReadinessPolicy {
            max_clarifications: 1,
            fallback: ReadinessFallback::Stall,
        };
        let mut conv = Conversation::new(Participant::member("erin"));
        let err = conv.advance(&asker, &ctx(policy)).await.unwrap_err();
        assert!(matches!(
            err,
            AskError::UnrecognizedReadinessAnswer { attempts: 1, ref last } if last == "eh"
        ));
        assert_eq!(conv.state(), ConversationState::AwaitingReadiness);
    }

    #[tokio::test]
    async fn error_leaves_state_and_answers_untouched() {
        let asker = QueueAsker::with(&["yes", "wrote tests"]);
        let mut conv = Conversation::new(Participant::member("finn"));
        let err = drive(&mut conv, &asker, &ctx(ReadinessPolicy::default())).await;
        assert!(matches!(err, Some(AskError::Timeout(_))));
        assert_eq!(conv.state(), ConversationState::AwaitingToday);
        assert_eq!(conv.answers().yesterday.as_deref(), Some("wrote tests"));
        assert_eq!(conv.answers().today, None);
    }

    #[test]
    fn answers_are_set_only_when_leaving_their_state() {
        let mut conv = Conversation::new(Participant::member("gus"));
        conv.apply(Step::Ready).unwrap();
        assert!(conv.answers().is_empty());
        conv.apply(Step::Answered("y".into())).unwrap();
        assert_eq!(conv.answers().yesterday.as_deref(), Some("y"));
        assert_eq!(conv.answers().today, None);
        assert!(conv.apply(Step::Declined).is_err());
        assert_eq!(conv.state(), ConversationState::AwaitingToday);
    }

    #[test]
    fn wait_is_clipped_to_the_deadline() {
        let ctx = AdvanceContext {
            question_timeout: Duration::from_secs(3600),
            deadline: Instant::now() + Duration::from_secs(5),
            readiness: ReadinessPolicy::default(),
            cancel: CancellationToken::new(),
        };
        assert!(ctx.wait() <= Duration::from_secs(5));
    }
}
