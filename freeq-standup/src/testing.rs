//! In-memory transport for tests and dry runs.
//!
//! [`ScriptedTransport`] plays each participant from a fixed list of
//! [`Reply`]s: every question sent to a participant's direct channel
//! consumes the next reply. Replies are emitted on whichever listening
//! session is open when they fire, stamped with the time they are emitted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{
    ChannelId, InboundMessage, Participant, ParticipantId, Transport, TransportEvent, format_timestamp,
};

/// Gap between the parts of a multi-message reply.
const FOLLOW_UP: Duration = Duration::from_millis(30);

/// How a scripted participant answers one question.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Answer straight away.
    Say(String),
    /// Answer after a pause.
    After(Duration, String),
    /// Answer, then have the platform redeliver the very same message.
    Duplicate(String),
    /// A redelivered message from before the question, then the real answer.
    StaleThen { stale: String, answer: String },
    /// Answer with a timestamp nobody can parse.
    Malformed(String),
    /// Never answer.
    Silent,
}

/// `Reply::Say` shorthand.
pub fn say(text: &str) -> Reply {
    Reply::Say(text.to_string())
}

/// A message the bot sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub channel: ChannelId,
    pub text: String,
}

#[derive(Default)]
struct Inner {
    members: Vec<Participant>,
    scripts: HashMap<ParticipantId, VecDeque<Reply>>,
    sent: Vec<Sent>,
    session: Option<mpsc::Sender<TransportEvent>>,
    /// Texts whose send never completes.
    stuck: HashSet<String>,
}

/// Scripted [`Transport`]. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<Inner>>,
    connects: Arc<AtomicU32>,
    disconnects: Arc<AtomicU32>,
    /// Sends still allowed before failures start, then failures left.
    failures: Arc<Mutex<(u32, u32)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel member that answers from `replies`.
    pub fn participant(self, participant: Participant, replies: Vec<Reply>) -> Self {
        {
            let mut inner = self.inner.lock();
            inner
                .scripts
                .insert(participant.id.clone(), replies.into_iter().collect());
            inner.members.push(participant);
        }
        self
    }

    /// Add a channel member with no script (a bot, or someone never asked).
    pub fn member(self, participant: Participant) -> Self {
        self.inner.lock().members.push(participant);
        self
    }

    /// Direct channel id used for `participant`.
    pub fn direct_channel(participant: &ParticipantId) -> ChannelId {
        ChannelId::new(format!("@{participant}"))
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<Sent> {
        self.inner.lock().sent.clone()
    }

    /// Texts sent to one channel, in order.
    pub fn sent_to(&self, channel: &ChannelId) -> Vec<String> {
        self.inner
            .lock()
            .sent
            .iter()
            .filter(|s| &s.channel == channel)
            .map(|s| s.text.clone())
            .collect()
    }

    /// Make the next `n` sends fail.
    pub fn fail_next_sends(&self, n: u32) {
        self.fail_after(0, n);
    }

    /// Let `ok` more sends through, then fail the `failures` after them.
    pub fn fail_after(&self, ok: u32, failures: u32) {
        *self.failures.lock() = (ok, failures);
    }

    /// Make every send of exactly `text` hang forever, like a link that
    /// went away mid-write.
    pub fn hang_on(&self, text: &str) {
        self.inner.lock().stuck.insert(text.to_string());
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    /// Push a raw event onto the open session. Returns `false` if nobody listens.
    pub async fn inject(&self, event: TransportEvent) -> bool {
        let session = self.inner.lock().session.clone();
        match session {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Drop the current session the way a flaky network would.
    pub async fn drop_connection(&self, reason: &str) -> bool {
        let session = self.inner.lock().session.take();
        let Some(tx) = session else {
            return false;
        };
        tx.send(TransportEvent::Disconnected {
            reason: reason.to_string(),
        })
        .await
        .is_ok()
    }

    fn take_failure(&self) -> bool {
        let mut failures = self.failures.lock();
        match *failures {
            (0, 0) => false,
            (0, ref mut left) => {
                *left -= 1;
                true
            }
            (ref mut ok, _) => {
                *ok -= 1;
                false
            }
        }
    }

    fn play(&self, participant: ParticipantId, channel: ChannelId, sent_at: DateTime<Utc>) {
        let Some(reply) = self
            .inner
            .lock()
            .scripts
            .get_mut(&participant)
            .and_then(VecDeque::pop_front)
        else {
            return;
        };

        let this = self.clone();
        tokio::spawn(async move {
            let message = |text: &str, timestamp: String| {
                TransportEvent::Message(InboundMessage {
                    channel: channel.clone(),
                    sender: participant.clone(),
                    text: text.to_string(),
                    timestamp,
                })
            };
            match reply {
                Reply::Say(text) => {
                    this.inject(message(&text, after(sent_at))).await;
                }
                Reply::After(delay, text) => {
                    tokio::time::sleep(delay).await;
                    this.inject(message(&text, after(sent_at))).await;
                }
                Reply::Duplicate(text) => {
                    let stamp = after(sent_at);
                    this.inject(message(&text, stamp.clone())).await;
                    tokio::time::sleep(FOLLOW_UP).await;
                    this.inject(message(&text, stamp)).await;
                }
                Reply::StaleThen { stale, answer } => {
                    let old = format_timestamp(sent_at - chrono::Duration::seconds(30));
                    this.inject(message(&stale, old)).await;
                    tokio::time::sleep(FOLLOW_UP).await;
                    this.inject(message(&answer, after(sent_at))).await;
                }
                Reply::Malformed(text) => {
                    this.inject(message(&text, "yesterday-ish".to_string())).await;
                }
                Reply::Silent => {}
            }
        });
    }
}

/// A stamp strictly later than `sent_at`, even on a coarse clock.
fn after(sent_at: DateTime<Utc>) -> String {
    let floor = sent_at + chrono::Duration::microseconds(1);
    format_timestamp(Utc::now().max(floor))
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn list_members(&self, _channel: &ChannelId) -> Result<Vec<Participant>, TransportError> {
        Ok(self.inner.lock().members.clone())
    }

    async fn open_direct_channel(
        &self,
        participant: &ParticipantId,
    ) -> Result<ChannelId, TransportError> {
        Ok(Self::direct_channel(participant))
    }

    async fn send_message(
        &self,
        channel: &ChannelId,
        text: &str,
    ) -> Result<DateTime<Utc>, TransportError> {
        let stuck = self.inner.lock().stuck.contains(text);
        if stuck {
            return std::future::pending().await;
        }
        if self.take_failure() {
            return Err(TransportError::Protocol("scripted send failure".to_string()));
        }
        let now = Utc::now();
        let recipient = {
            let mut inner = self.inner.lock();
            inner.sent.push(Sent {
                channel: channel.clone(),
                text: text.to_string(),
            });
            inner
                .members
                .iter()
                .map(|m| &m.id)
                .find(|id| Self::direct_channel(id) == *channel)
                .cloned()
        };
        if let Some(participant) = recipient {
            self.play(participant, channel.clone(), now);
        }
        Ok(now)
    }

    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(256);
        self.inner.lock().session = Some(tx);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.lock().session = None;
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
