//! The chat-platform boundary.
//!
//! The engine never talks to a network directly. Everything it needs from
//! the platform goes through [`Transport`]: listing channel members, opening
//! direct-message channels, sending text, and a stream of inbound events.
//! [`crate::irc::IrcTransport`] implements it over a freeq IRC connection and
//! [`crate::testing::ScriptedTransport`] implements it in memory.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{AskError, TransportError};

/// Opaque participant identifier (an IRC nick, a Slack user id, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque channel identifier. Direct channels and group channels share it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One member of the surveyed channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub avatar: Option<String>,
    pub is_bot: bool,
    pub is_deleted: bool,
}

impl Participant {
    /// A regular human member whose display name is their id.
    pub fn member(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id: ParticipantId(id),
            avatar: None,
            is_bot: false,
            is_deleted: false,
        }
    }

    pub fn bot(id: impl Into<String>) -> Self {
        Self {
            is_bot: true,
            ..Self::member(id)
        }
    }

    /// Bots and deleted accounts are never surveyed.
    pub fn is_eligible(&self) -> bool {
        !self.is_bot && !self.is_deleted
    }
}

/// A chat message as delivered by the platform.
///
/// `timestamp` is kept in the platform's raw form; it is parsed only when a
/// pending question needs to compare it, so a malformed stamp on somebody
/// else's message never disturbs an unrelated conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel: ChannelId,
    pub sender: ParticipantId,
    pub text: String,
    pub timestamp: String,
}

impl InboundMessage {
    pub fn parsed_timestamp(&self) -> Result<DateTime<Utc>, AskError> {
        parse_timestamp(&self.timestamp)
    }
}

/// Events on the transport's inbound stream.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// The listening session dropped.
    Disconnected { reason: String },
    /// A non-fatal error reported by the platform.
    Error(String),
}

/// The chat platform as the engine sees it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Members of a group channel.
    async fn list_members(&self, channel: &ChannelId) -> Result<Vec<Participant>, TransportError>;

    /// The direct-message channel with one participant. Idempotent.
    async fn open_direct_channel(&self, participant: &ParticipantId)
    -> Result<ChannelId, TransportError>;

    /// Post text to a channel, returning the time the platform stamped it with.
    async fn send_message(
        &self,
        channel: &ChannelId,
        text: &str,
    ) -> Result<DateTime<Utc>, TransportError>;

    /// Start (or resume) a listening session.
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// End the listening session.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Parse an inbound timestamp.
///
/// Accepts RFC 3339 (IRCv3 `server-time`) and unix `"<secs>.<fraction>"`
/// (Slack `ts`). The fraction is read as a decimal fraction of a second, so
/// `"1700000000.5"` is half a second past the whole second.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, AskError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    let malformed = || AskError::ReceiveMalformed(format!("malformed timestamp: {raw:?}"));
    let (secs, frac) = raw.split_once('.').ok_or_else(malformed)?;
    if secs.is_empty()
        || frac.is_empty()
        || frac.len() > 9
        || !secs.bytes().all(|b| b.is_ascii_digit())
        || !frac.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(malformed());
    }
    let secs: i64 = secs.parse().map_err(|_| malformed())?;
    let nanos: u32 = format!("{frac:0<9}").parse().map_err(|_| malformed())?;
    Utc.timestamp_opt(secs, nanos).single().ok_or_else(malformed)
}

/// Render a timestamp in the RFC 3339 form [`parse_timestamp`] reads back.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}
