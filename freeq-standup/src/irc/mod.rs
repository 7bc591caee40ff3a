//! [`Transport`] over an IRC connection.
//!
//! One connection serves everything: NAMES for the member list, PRIVMSG to
//! a nick for direct messages, and inbound PRIVMSGs for replies. A direct
//! channel on IRC is simply the other person's nick.
//!
//! The connection is opened lazily by whichever call needs it first and is
//! reopened the same way after it drops.

mod message;
mod session;

pub use message::Message;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;

use crate::error::TransportError;
use crate::transport::{ChannelId, Participant, ParticipantId, Transport, TransportEvent};
use session::{Command, Identity, Shared, run_irc};

/// How long registration or a NAMES reply may take.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Channel membership prefixes stripped from NAMES entries.
const MEMBER_PREFIXES: &[char] = &['@', '%', '+', '~', '&'];

/// Connection settings.
#[derive(Debug, Clone)]
pub struct IrcConfig {
    /// Server address (host:port).
    pub server_addr: String,
    pub nick: String,
    /// Use TLS. Always on for port 6697.
    pub tls: bool,
    /// Nicks of other bots; they are listed but never surveyed.
    pub bots: Vec<String>,
}

impl IrcConfig {
    fn use_tls(&self) -> bool {
        self.tls || self.server_addr.ends_with(":6697")
    }
}

struct Connection {
    cmd_tx: mpsc::Sender<Command>,
}

pub struct IrcTransport {
    config: IrcConfig,
    shared: Arc<Shared>,
    conn: tokio::sync::Mutex<Option<Connection>>,
    /// Channels joined on the current connection.
    joined: parking_lot::Mutex<HashSet<String>>,
}

impl IrcTransport {
    pub fn new(config: IrcConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            conn: tokio::sync::Mutex::new(None),
            joined: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    /// The bot's current nick on the server.
    pub fn nick(&self) -> String {
        self.shared.nick()
    }

    /// A command sender for a live, registered connection, opening one if needed.
    async fn sender(&self) -> Result<mpsc::Sender<Command>, TransportError> {
        let mut conn = self.conn.lock().await;
        if let Some(c) = conn.as_ref()
            && !c.cmd_tx.is_closed()
        {
            return Ok(c.cmd_tx.clone());
        }
        let cmd_tx = self.open().await?;
        self.joined.lock().clear();
        *conn = Some(Connection {
            cmd_tx: cmd_tx.clone(),
        });
        Ok(cmd_tx)
    }

    async fn open(&self) -> Result<mpsc::Sender<Command>, TransportError> {
        let addr = &self.config.server_addr;
        let tls = self.config.use_tls();
        tracing::info!(server = %addr, tls, nick = %self.config.nick, "Connecting");

        let identity = Identity {
            nick: self.config.nick.clone(),
            user: "standup".to_string(),
            realname: "freeq standup bot".to_string(),
        };
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (reg_tx, reg_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);

        let tcp = TcpStream::connect(addr).await?;
        if tls {
            let connector = TlsConnector::from(Arc::new(tls_config()));
            let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|e| TransportError::Protocol(format!("bad server name {host:?}: {e}")))?;
            let stream = connector.connect(server_name, tcp).await?;
            let (reader, writer) = tokio::io::split(stream);
            tokio::spawn(run_irc(BufReader::new(reader), writer, identity, shared, cmd_rx, reg_tx));
        } else {
            let (reader, writer) = tokio::io::split(tcp);
            tokio::spawn(run_irc(BufReader::new(reader), writer, identity, shared, cmd_rx, reg_tx));
        }

        match tokio::time::timeout(REPLY_TIMEOUT, reg_rx).await {
            Ok(Ok(_nick)) => Ok(cmd_tx),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                let _ = cmd_tx.send(Command::Quit("registration timed out".into())).await;
                Err(TransportError::Protocol("registration timed out".into()))
            }
        }
    }

    async fn command(&self, command: Command) -> Result<(), TransportError> {
        self.sender()
            .await?
            .send(command)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// JOIN `channel` unless this connection already has.
    async fn join(&self, channel: &ChannelId) -> Result<(), TransportError> {
        let tx = self.sender().await?;
        if self.joined.lock().insert(channel.as_str().to_ascii_lowercase()) {
            tx.send(Command::Join(channel.to_string()))
                .await
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    fn participant(&self, entry: &str, own_nick: &str) -> Option<Participant> {
        let nick = entry.trim_start_matches(MEMBER_PREFIXES);
        if nick.is_empty() {
            return None;
        }
        let is_bot = nick.eq_ignore_ascii_case(own_nick)
            || self.config.bots.iter().any(|b| b.eq_ignore_ascii_case(nick));
        Some(Participant {
            is_bot,
            ..Participant::member(nick)
        })
    }
}

#[async_trait]
impl Transport for IrcTransport {
    async fn list_members(&self, channel: &ChannelId) -> Result<Vec<Participant>, TransportError> {
        let names = self.shared.await_names(channel.as_str());
        self.join(channel).await?;
        self.command(Command::Names(channel.to_string())).await?;

        let entries = match tokio::time::timeout(REPLY_TIMEOUT, names).await {
            Ok(Ok(entries)) => entries,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => return Err(TransportError::Protocol(format!("no NAMES reply for {channel}"))),
        };
        let own_nick = self.shared.nick();
        let mut members: Vec<Participant> = entries
            .iter()
            .filter_map(|entry| self.participant(entry, &own_nick))
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members.dedup_by(|a, b| a.id == b.id);
        tracing::debug!(%channel, count = members.len(), "Listed channel members");
        Ok(members)
    }

    async fn open_direct_channel(
        &self,
        participant: &ParticipantId,
    ) -> Result<ChannelId, TransportError> {
        Ok(ChannelId::new(participant.as_str()))
    }

    async fn send_message(
        &self,
        channel: &ChannelId,
        text: &str,
    ) -> Result<DateTime<Utc>, TransportError> {
        if channel.as_str().starts_with(['#', '&']) {
            self.join(channel).await?;
        }
        let sent_at = Utc::now();
        self.command(Command::Privmsg {
            target: channel.to_string(),
            text: text.to_string(),
        })
        .await?;
        Ok(sent_at)
    }

    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        self.sender().await?;
        let (tx, rx) = mpsc::channel(1024);
        self.shared.set_listener(Some(tx));
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.shared.set_listener(None);
        if let Some(conn) = self.conn.lock().await.take() {
            let _ = conn.cmd_tx.send(Command::Quit("standup finished".into())).await;
        }
        Ok(())
    }
}

fn tls_config() -> rustls::ClientConfig {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let root_store = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}
