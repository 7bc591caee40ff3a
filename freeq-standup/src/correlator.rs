//! Question/answer correlation.
//!
//! Chat platforms push messages at us in whatever order they like, with
//! duplicates, and interleaved with everybody else's traffic. The
//! [`Correlator`] turns that into a request/response call: send one question
//! to one participant, then wait for the first message that participant
//! sends on their direct channel *after* the question went out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{HandlerId, HandlerRegistry};
use crate::error::{AskError, TransportError};
use crate::transport::{ChannelId, InboundMessage, ParticipantId, Transport};

/// Anything that can put a question to a participant and wait for the reply.
///
/// [`Correlator`] is the real implementation; conversations only see this
/// trait so they can be driven by a script in tests.
#[async_trait]
pub trait Asker: Send + Sync {
    /// Send `question` and wait up to `wait` for the answer.
    async fn ask(
        &self,
        participant: &ParticipantId,
        question: &str,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, AskError>;

    /// Send `text` without waiting for anything back.
    async fn tell(&self, participant: &ParticipantId, text: &str) -> Result<(), AskError>;
}

/// Participant → direct channel cache.
///
/// The lock is held across the platform lookup so that two conversations
/// racing for the same participant never open the channel twice.
pub struct DirectChannels {
    transport: Arc<dyn Transport>,
    cache: tokio::sync::Mutex<HashMap<ParticipantId, ChannelId>>,
}

impl DirectChannels {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, participant: &ParticipantId) -> Result<ChannelId, TransportError> {
        let mut cache = self.cache.lock().await;
        if let Some(channel) = cache.get(participant) {
            return Ok(channel.clone());
        }
        let channel = self.transport.open_direct_channel(participant).await?;
        tracing::debug!(participant = %participant, channel = %channel, "Opened direct channel");
        cache.insert(participant.clone(), channel.clone());
        Ok(channel)
    }
}

/// One outstanding question. Lives exactly as long as one `send_and_await`.
struct PendingQuestion {
    participant: ParticipantId,
    channel: ChannelId,
    sent_at: DateTime<Utc>,
    slot: Mutex<Option<oneshot::Sender<Result<String, AskError>>>>,
}

impl PendingQuestion {
    /// Resolve with `message` if it is a reply to this question.
    fn offer(&self, message: &InboundMessage) {
        if message.channel != self.channel || message.sender != self.participant {
            return;
        }
        let outcome = match message.parsed_timestamp() {
            Ok(ts) if ts <= self.sent_at => {
                tracing::trace!(
                    participant = %self.participant,
                    event_ts = %ts,
                    sent_at = %self.sent_at,
                    "Skipping stale message"
                );
                return;
            }
            Ok(_) if message.text.trim().is_empty() => return,
            Ok(_) => Ok(message.text.clone()),
            Err(e) => Err(e),
        };
        if let Some(tx) = self.slot.lock().take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Removes a handler from the registry when dropped.
struct Registration<'a> {
    registry: &'a HandlerRegistry,
    id: HandlerId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

/// Marks a participant as having a question in flight.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<ParticipantId>>,
    participant: ParticipantId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.participant);
    }
}

/// Sends questions and matches replies to them.
pub struct Correlator {
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    channels: DirectChannels,
    in_flight: Mutex<HashSet<ParticipantId>>,
}

impl Correlator {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            channels: DirectChannels::new(Arc::clone(&transport)),
            transport,
            registry,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Ask `question` and return the participant's next direct message.
    ///
    /// The handler is registered before the question is sent, and only
    /// messages stamped strictly after the send time qualify, so neither a
    /// fast reply nor a redelivered old one can be mismatched.
    pub async fn send_and_await(
        &self,
        participant: &ParticipantId,
        question: &str,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, AskError> {
        let _in_flight = self.claim(participant)?;
        if cancel.is_cancelled() {
            return Err(AskError::Cancelled);
        }

        let channel = self
            .channels
            .get(participant)
            .await
            .map_err(AskError::SendFailed)?;

        let (tx, rx) = oneshot::channel();
        let pending = Arc::new(PendingQuestion {
            participant: participant.clone(),
            channel: channel.clone(),
            sent_at: Utc::now(),
            slot: Mutex::new(Some(tx)),
        });
        let id = {
            let pending = Arc::clone(&pending);
            self.registry.register(move |message| pending.offer(message))
        };
        let _registration = Registration {
            registry: self.registry.as_ref(),
            id,
        };

        let exchange = async {
            self.transport
                .send_message(&channel, question)
                .await
                .map_err(AskError::SendFailed)?;
            tracing::debug!(participant = %participant, question, "Question sent");
            rx.await.unwrap_or(Err(AskError::Cancelled))
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(AskError::Cancelled),
            _ = tokio::time::sleep(wait) => Err(AskError::Timeout(wait)),
            outcome = exchange => outcome,
        }
    }

    /// Send a message to a participant's direct channel.
    pub async fn notify(&self, participant: &ParticipantId, text: &str) -> Result<(), AskError> {
        let channel = self
            .channels
            .get(participant)
            .await
            .map_err(AskError::SendFailed)?;
        self.transport
            .send_message(&channel, text)
            .await
            .map(|_| ())
            .map_err(AskError::SendFailed)
    }

    fn claim(&self, participant: &ParticipantId) -> Result<InFlight<'_>, AskError> {
        if !self.in_flight.lock().insert(participant.clone()) {
            return Err(AskError::Busy(participant.to_string()));
        }
        Ok(InFlight {
            set: &self.in_flight,
            participant: participant.clone(),
        })
    }
}

#[async_trait]
impl Asker for Correlator {
    async fn ask(
        &self,
        participant: &ParticipantId,
        question: &str,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, AskError> {
        self.send_and_await(participant, question, wait, cancel).await
    }

    async fn tell(&self, participant: &ParticipantId, text: &str) -> Result<(), AskError> {
        self.notify(participant, text).await
    }
}
