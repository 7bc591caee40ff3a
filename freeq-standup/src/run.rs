//! One standup run across every eligible participant.
//!
//! Every conversation gets its own task. The run owns a single
//! cancellation token; it fires when the last conversation reports
//! completion, when the deadline passes, or when the caller cancels, and
//! every in-flight question returns promptly once it does.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::conversation::{AdvanceContext, Conversation, ReadinessPolicy, questions};
use crate::correlator::{Asker, Correlator};
use crate::dispatch::{Dispatcher, HandlerRegistry, ReconnectPolicy};
use crate::transport::{Participant, ParticipantId, Transport};

/// How long a farewell may take before the task gives up on it.
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(5);

/// Limits and policies for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// How long the whole run may last.
    pub deadline: Duration,
    /// How long to wait for any single answer.
    pub question_timeout: Duration,
    pub readiness: ReadinessPolicy,
    pub reconnect: ReconnectPolicy,
    pub reconnect_backoff: Backoff,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(3 * 3600),
            question_timeout: Duration::from_secs(3600),
            readiness: ReadinessPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            reconnect_backoff: Backoff::default(),
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Every conversation reached `Complete`.
    Quorum,
    /// The deadline passed first.
    Deadline,
    /// The caller cancelled the run.
    Cancelled,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::Quorum => write!(f, "everyone finished"),
            EndReason::Deadline => write!(f, "deadline reached"),
            EndReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Everything a finished run hands back.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub conversations: BTreeMap<ParticipantId, Conversation>,
    pub reason: EndReason,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunOutcome {
    pub fn completed(&self) -> usize {
        self.conversations.values().filter(|c| c.is_complete()).count()
    }
}

pub struct Run {
    transport: Arc<dyn Transport>,
    config: RunConfig,
    conversations: BTreeMap<ParticipantId, Conversation>,
    cancel: CancellationToken,
}

impl Run {
    /// Build a run over `participants`, skipping bots and deleted accounts.
    pub fn new(transport: Arc<dyn Transport>, config: RunConfig, participants: Vec<Participant>) -> Self {
        let conversations = participants
            .into_iter()
            .filter(|p| {
                let eligible = p.is_eligible();
                if !eligible {
                    tracing::debug!(participant = %p.id, bot = p.is_bot, deleted = p.is_deleted, "Skipping ineligible member");
                }
                eligible
            })
            .map(|p| (p.id.clone(), Conversation::new(p)))
            .collect();

        Self {
            transport,
            config,
            conversations,
            cancel: CancellationToken::new(),
        }
    }

    pub fn participants(&self) -> impl Iterator<Item = &ParticipantId> {
        self.conversations.keys()
    }

    /// A handle that ends the run early when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// End the run early when `parent` is cancelled. Ending the run does
    /// not cancel `parent`.
    pub fn cancelled_by(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Run every conversation to completion, deadline, or cancellation.
    pub async fn start(self) -> RunOutcome {
        let Run {
            transport,
            config,
            conversations,
            cancel,
        } = self;

        let started = Instant::now();
        let deadline = started + config.deadline;
        let total = conversations.len();
        tracing::info!(participants = total, deadline_secs = config.deadline.as_secs(), "Standup run starting");

        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&transport), Arc::clone(&registry))
            .with_policy(config.reconnect)
            .with_backoff(config.reconnect_backoff);
        let mut sessions = dispatcher.sessions();
        let listener = tokio::spawn(dispatcher.run(cancel.clone()));

        // Replies sent before anyone listens would be lost.
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep_until(deadline) => {}
            listening = sessions.wait_for(|n| *n > 0) => {
                if listening.is_err() {
                    tracing::warn!("Event listener stopped before connecting; replies will not be seen");
                }
            }
        }

        let asker: Arc<dyn Asker> = Arc::new(Correlator::new(transport, registry));

        let ctx = AdvanceContext {
            question_timeout: config.question_timeout,
            deadline,
            readiness: config.readiness,
            cancel: cancel.clone(),
        };

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<ParticipantId>();
        let mut fallback = BTreeMap::new();
        let mut tasks = JoinSet::new();
        for (id, conversation) in conversations {
            fallback.insert(id, conversation.participant().clone());
            tasks.spawn(drive(
                conversation,
                Arc::clone(&asker),
                ctx.clone(),
                done_tx.clone(),
            ));
        }
        drop(done_tx);

        let reason = watch_completion(total, &mut done_rx, deadline, &cancel).await;
        cancel.cancel();
        tracing::info!(%reason, elapsed_ms = started.elapsed().as_millis() as u64, "Standup run ending");

        let mut finished = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(conversation) => {
                    let id = conversation.participant().id.clone();
                    fallback.remove(&id);
                    finished.insert(id, conversation);
                }
                Err(e) => tracing::error!(error = %e, "Conversation task failed"),
            }
        }
        // A task that panicked lost its record; report the participant as untouched.
        for (id, participant) in fallback {
            finished.insert(id, Conversation::new(participant));
        }

        if let Err(e) = listener.await {
            tracing::error!(error = %e, "Event dispatch task failed");
        }

        RunOutcome {
            conversations: finished,
            reason,
            elapsed: started.elapsed(),
        }
    }
}

/// Wait for quorum, deadline, or cancellation, whichever comes first.
async fn watch_completion(
    total: usize,
    done_rx: &mut mpsc::UnboundedReceiver<ParticipantId>,
    deadline: Instant,
    cancel: &CancellationToken,
) -> EndReason {
    let mut completed = 0usize;
    let deadline_sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(deadline_sleep);

    while completed < total {
        tokio::select! {
            _ = cancel.cancelled() => return EndReason::Cancelled,
            _ = &mut deadline_sleep => return EndReason::Deadline,
            done = done_rx.recv() => match done {
                Some(id) => {
                    completed += 1;
                    tracing::info!(participant = %id, completed, total, "Participant finished");
                }
                // Every task has exited without all of them completing;
                // the stalled ones hold the run until the deadline.
                None => tokio::select! {
                    _ = cancel.cancelled() => return EndReason::Cancelled,
                    _ = &mut deadline_sleep => return EndReason::Deadline,
                },
            },
        }
    }
    EndReason::Quorum
}

/// One conversation's task: advance until complete, cancelled, or stuck.
async fn drive(
    mut conversation: Conversation,
    asker: Arc<dyn Asker>,
    ctx: AdvanceContext,
    done: mpsc::UnboundedSender<ParticipantId>,
) -> Conversation {
    let id = conversation.participant().id.clone();

    while !conversation.is_complete() && !ctx.cancel.is_cancelled() {
        if let Err(e) = conversation.advance(asker.as_ref(), &ctx).await {
            tracing::warn!(
                participant = %id,
                state = %conversation.state(),
                error = %e,
                "Conversation stopped"
            );
            return conversation;
        }
    }

    if conversation.is_complete() {
        let _ = done.send(id.clone());
        tokio::select! {
            biased;
            sent = asker.tell(&id, questions::DONE) => {
                if let Err(e) = sent {
                    tracing::debug!(participant = %id, error = %e, "Could not send farewell");
                }
            }
            _ = ctx.cancel.cancelled() => {
                tracing::debug!(participant = %id, "Run ended before the farewell went out");
            }
            _ = tokio::time::sleep(FAREWELL_TIMEOUT) => {
                tracing::debug!(participant = %id, "Farewell timed out");
            }
        }
    }
    conversation
}
