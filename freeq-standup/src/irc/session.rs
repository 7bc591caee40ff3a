//! One IRC connection: registration, keepalive and inbound routing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

use super::message::Message;
use crate::error::TransportError;
use crate::transport::{ChannelId, InboundMessage, ParticipantId, TransportEvent, format_timestamp};

/// Nick collisions tolerated during registration.
const MAX_NICK_TRIES: u32 = 5;
const PING_INTERVAL: Duration = Duration::from_secs(60);
const PING_TIMEOUT: Duration = Duration::from_secs(120);

/// Lines the transport asks the connection to write.
#[derive(Debug)]
pub(crate) enum Command {
    Privmsg { target: String, text: String },
    Join(String),
    Names(String),
    Quit(String),
}

/// A NAMES request waiting for its end-of-list.
struct NamesRequest {
    nicks: Vec<String>,
    waiters: Vec<oneshot::Sender<Vec<String>>>,
}

/// State shared between the connection task and [`super::IrcTransport`].
#[derive(Default)]
pub(crate) struct Shared {
    /// Nick the server actually registered us under.
    nick: Mutex<String>,
    /// Where inbound events go; `None` while nobody listens.
    listener: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    names: Mutex<HashMap<String, NamesRequest>>,
}

impl Shared {
    pub fn nick(&self) -> String {
        self.nick.lock().clone()
    }

    pub fn set_listener(&self, tx: Option<mpsc::Sender<TransportEvent>>) {
        *self.listener.lock() = tx;
    }

    /// Register interest in the next complete NAMES list for `channel`.
    pub fn await_names(&self, channel: &str) -> oneshot::Receiver<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.names
            .lock()
            .entry(channel.to_ascii_lowercase())
            .or_insert_with(|| NamesRequest {
                nicks: Vec::new(),
                waiters: Vec::new(),
            })
            .waiters
            .push(tx);
        rx
    }

    fn emit(&self, event: TransportEvent) {
        let listener = self.listener.lock().clone();
        if let Some(tx) = listener
            && tx.try_send(event).is_err()
        {
            tracing::warn!("Inbound event dropped, listener full or gone");
        }
    }

    fn names_chunk(&self, channel: &str, nicks: &str) {
        if let Some(request) = self.names.lock().get_mut(&channel.to_ascii_lowercase()) {
            request.nicks.extend(nicks.split_whitespace().map(str::to_string));
        }
    }

    fn names_end(&self, channel: &str) {
        let key = channel.to_ascii_lowercase();
        let mut names = self.names.lock();
        let ready = names.get(&key).is_some_and(|r| !r.waiters.is_empty());
        if !ready {
            return;
        }
        if let Some(request) = names.remove(&key) {
            for waiter in request.waiters {
                let _ = waiter.send(request.nicks.clone());
            }
        }
    }
}

/// Connection parameters the loop needs.
#[derive(Debug, Clone)]
pub(crate) struct Identity {
    pub nick: String,
    pub user: String,
    pub realname: String,
}

/// Drive one connection until it drops or QUIT is sent.
///
/// `registered` fires once with the nick from RPL_WELCOME. The listener, if
/// any, always receives a final `Disconnected`.
pub(crate) async fn run_irc<R, W>(
    reader: R,
    writer: W,
    identity: Identity,
    shared: Arc<Shared>,
    cmd_rx: mpsc::Receiver<Command>,
    registered: oneshot::Sender<String>,
) where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let reason = match session_loop(reader, writer, &identity, &shared, cmd_rx, registered).await {
        Ok(reason) => reason,
        Err(e) => e.to_string(),
    };
    tracing::info!(%reason, "IRC connection closed");
    shared.emit(TransportEvent::Disconnected { reason });
    shared.set_listener(None);
    // Nobody will answer outstanding NAMES requests now
    shared.names.lock().clear();
}

async fn session_loop<R, W>(
    mut reader: R,
    mut writer: W,
    identity: &Identity,
    shared: &Shared,
    mut cmd_rx: mpsc::Receiver<Command>,
    registered: oneshot::Sender<String>,
) -> Result<String, TransportError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_line(&mut writer, "CAP LS 302").await?;
    write_line(&mut writer, &format!("NICK {}", identity.nick)).await?;
    write_line(
        &mut writer,
        &format!("USER {} 0 * :{}", identity.user, identity.realname),
    )
    .await?;
    *shared.nick.lock() = identity.nick.clone();

    let mut registered = Some(registered);
    let mut nick_tries: u32 = 0;
    let mut history_batches: Vec<String> = Vec::new();
    let mut line_buf = String::new();
    let mut last_activity = Instant::now();
    let mut pinged = false;

    loop {
        let wake = last_activity + if pinged { PING_TIMEOUT } else { PING_INTERVAL };
        tokio::select! {
            result = reader.read_line(&mut line_buf) => {
                if result? == 0 {
                    return Ok("EOF".to_string());
                }
                last_activity = Instant::now();
                pinged = false;

                if let Some(msg) = Message::parse(&line_buf) {
                    tracing::trace!(line = line_buf.trim_end(), "<<");
                    match msg.command.as_str() {
                        "PING" => {
                            let token = msg.params.first().map(String::as_str).unwrap_or("");
                            write_line(&mut writer, &format!("PONG :{token}")).await?;
                        }
                        "CAP" => handle_cap(&msg, &mut writer).await?,
                        // ERR_NICKNAMEINUSE
                        "433" if registered.is_some() => {
                            nick_tries += 1;
                            if nick_tries > MAX_NICK_TRIES {
                                return Err(TransportError::Protocol(format!(
                                    "nick {} in use after {MAX_NICK_TRIES} retries",
                                    identity.nick
                                )));
                            }
                            let alt = format!("{}{nick_tries}", identity.nick);
                            tracing::info!(nick = %alt, "Nick in use, retrying");
                            *shared.nick.lock() = alt.clone();
                            write_line(&mut writer, &format!("NICK {alt}")).await?;
                        }
                        "001" => {
                            let nick = msg.params.first().cloned().unwrap_or_else(|| shared.nick());
                            *shared.nick.lock() = nick.clone();
                            if let Some(tx) = registered.take() {
                                tracing::info!(%nick, "Registered");
                                let _ = tx.send(nick);
                            }
                        }
                        "NICK" => {
                            if msg.source_nick().is_some_and(|n| n.eq_ignore_ascii_case(&shared.nick()))
                                && let Some(new) = msg.params.first()
                            {
                                *shared.nick.lock() = new.clone();
                            }
                        }
                        "BATCH" => {
                            if let Some(id) = msg.params.first().and_then(|p| p.strip_prefix('+')) {
                                if msg.params.get(1).is_some_and(|t| t == "chathistory") {
                                    history_batches.push(id.to_string());
                                }
                            } else if let Some(id) = msg.params.first().and_then(|p| p.strip_prefix('-')) {
                                history_batches.retain(|b| b != id);
                            }
                        }
                        // RPL_NAMREPLY
                        "353" => {
                            if msg.params.len() >= 4 {
                                shared.names_chunk(&msg.params[2], &msg.params[3]);
                            }
                        }
                        // RPL_ENDOFNAMES
                        "366" => {
                            if let Some(channel) = msg.params.get(1) {
                                shared.names_end(channel);
                            }
                        }
                        "PRIVMSG" => {
                            let replayed = msg.tag("batch").is_some_and(|b| history_batches.iter().any(|h| h == b));
                            if !replayed && let Some(inbound) = inbound_privmsg(&msg, &shared.nick()) {
                                shared.emit(TransportEvent::Message(inbound));
                            }
                        }
                        "ERROR" => {
                            let text = msg.params.first().cloned().unwrap_or_default();
                            return Ok(text);
                        }
                        _ => {}
                    }
                }
                line_buf.clear();
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Privmsg { target, text }) => {
                    for line in text.lines().filter(|l| !l.is_empty()) {
                        write_line(&mut writer, &Message::new("PRIVMSG", &[&target, line]).to_string()).await?;
                    }
                }
                Some(Command::Join(channel)) => write_line(&mut writer, &format!("JOIN {channel}")).await?,
                Some(Command::Names(channel)) => write_line(&mut writer, &format!("NAMES {channel}")).await?,
                Some(Command::Quit(reason)) => {
                    write_line(&mut writer, &Message::new("QUIT", &[&reason]).to_string()).await?;
                    return Ok("quit".to_string());
                }
                None => return Ok("transport dropped".to_string()),
            },
            _ = tokio::time::sleep_until(wake) => {
                if pinged {
                    return Ok("Ping timeout".to_string());
                }
                write_line(&mut writer, "PING :keepalive").await?;
                pinged = true;
            }
        }
    }
}

/// A PRIVMSG as an inbound message. Messages to us become direct messages
/// whose channel is the sender's nick.
fn inbound_privmsg(msg: &Message, own_nick: &str) -> Option<InboundMessage> {
    let sender = msg.source_nick()?;
    let target = msg.params.first()?;
    let text = msg.params.get(1)?;
    // CTCP (ACTION, VERSION, ...)
    if text.starts_with('\u{1}') {
        return None;
    }
    let channel = if target.eq_ignore_ascii_case(own_nick) {
        sender
    } else {
        target.as_str()
    };
    Some(InboundMessage {
        channel: ChannelId::new(channel),
        sender: ParticipantId::new(sender),
        text: text.clone(),
        timestamp: format_timestamp(Utc::now()),
    })
}

async fn handle_cap<W: AsyncWrite + Unpin>(msg: &Message, writer: &mut W) -> Result<(), TransportError> {
    let subcmd = msg.params.get(1).map(|s| s.to_ascii_uppercase());
    match subcmd.as_deref() {
        Some("LS") => {
            // Multi-line LS: wait for the final chunk
            if msg.params.get(2).is_some_and(|p| p == "*") {
                return Ok(());
            }
            let offered = msg.params.last().map(String::as_str).unwrap_or("");
            let wanted: Vec<&str> = ["message-tags", "server-time", "batch"]
                .into_iter()
                .filter(|cap| offered.split_whitespace().any(|o| o.split('=').next() == Some(*cap)))
                .collect();
            if wanted.is_empty() {
                write_line(writer, "CAP END").await?;
            } else {
                write_line(writer, &format!("CAP REQ :{}", wanted.join(" "))).await?;
            }
        }
        Some("ACK") | Some("NAK") => write_line(writer, "CAP END").await?,
        _ => {}
    }
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<(), TransportError> {
    tracing::trace!(line, ">>");
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader, DuplexStream};

    struct FakeServer {
        to_client: DuplexStream,
        from_client: BufReader<DuplexStream>,
    }

    impl FakeServer {
        async fn send(&mut self, line: &str) {
            self.to_client.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
        }

        async fn expect(&mut self, prefix: &str) -> String {
            loop {
                let mut line = String::new();
                let n = tokio::time::timeout(Duration::from_secs(2), self.from_client.read_line(&mut line))
                    .await
                    .expect("client went quiet")
                    .unwrap();
                assert!(n > 0, "client closed while waiting for {prefix:?}");
                let line = line.trim_end().to_string();
                if line.starts_with(prefix) {
                    return line;
                }
            }
        }
    }

    struct Harness {
        server: FakeServer,
        shared: Arc<Shared>,
        cmd_tx: mpsc::Sender<Command>,
        registered: oneshot::Receiver<String>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start() -> Harness {
        let (client_read, server_write) = tokio::io::duplex(4096);
        let (server_read, client_write) = tokio::io::duplex(4096);
        let shared = Arc::new(Shared::default());
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (reg_tx, reg_rx) = oneshot::channel();
        let identity = Identity {
            nick: "standup".into(),
            user: "standup".into(),
            realname: "standup bot".into(),
        };
        let task = tokio::spawn(run_irc(
            BufReader::new(client_read),
            client_write,
            identity,
            Arc::clone(&shared),
            cmd_rx,
            reg_tx,
        ));
        Harness {
            server: FakeServer {
                to_client: server_write,
                from_client: BufReader::new(server_read),
            },
            shared,
            cmd_tx,
            registered: reg_rx,
            task,
        }
    }

    async fn register(h: &mut Harness) -> String {
        h.server.expect("CAP LS").await;
        h.server.expect("NICK standup").await;
        h.server.expect("USER standup").await;
        h.server.send(":srv CAP * LS :message-tags server-time batch sasl").await;
        assert_eq!(h.server.expect("CAP REQ").await, "CAP REQ :message-tags server-time batch");
        h.server.send(":srv CAP standup ACK :message-tags server-time batch").await;
        h.server.expect("CAP END").await;
        h.server.send(":srv 001 standup :Welcome").await;
        (&mut h.registered).await.unwrap()
    }

    #[tokio::test]
    async fn registers_and_answers_ping() {
        let mut h = start();
        assert_eq!(register(&mut h).await, "standup");
        h.server.send("PING :abc").await;
        assert_eq!(h.server.expect("PONG").await, "PONG :abc");
    }

    #[tokio::test]
    async fn nick_collision_retries_with_suffix() {
        let mut h = start();
        h.server.expect("USER").await;
        h.server.send(":srv 433 * standup :Nickname is already in use").await;
        assert_eq!(h.server.expect("NICK").await, "NICK standup1");
        h.server.send(":srv 433 * standup1 :Nickname is already in use").await;
        assert_eq!(h.server.expect("NICK").await, "NICK standup2");
        h.server.send(":srv 001 standup2 :Welcome").await;
        assert_eq!((&mut h.registered).await.unwrap(), "standup2");
        assert_eq!(h.shared.nick(), "standup2");
    }

    #[tokio::test]
    async fn gives_up_after_too_many_collisions() {
        let mut h = start();
        let (tx, mut events) = mpsc::channel(8);
        h.shared.set_listener(Some(tx));
        h.server.expect("USER").await;
        for _ in 0..=MAX_NICK_TRIES {
            h.server.send(":srv 433 * x :Nickname is already in use").await;
        }
        let Some(TransportEvent::Disconnected { reason }) = events.recv().await else {
            panic!("expected a disconnect");
        };
        assert!(reason.contains("in use"), "{reason}");
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn direct_messages_use_the_sender_as_channel() {
        let mut h = start();
        register(&mut h).await;
        let (tx, mut events) = mpsc::channel(8);
        h.shared.set_listener(Some(tx));

        h.server.send(":alice!a@host PRIVMSG standup :yes").await;
        h.server.send(":bob!b@host PRIVMSG #team :morning").await;
        h.server.send(":carol!c@host PRIVMSG standup :\u{1}ACTION waves\u{1}").await;

        let Some(TransportEvent::Message(dm)) = events.recv().await else { panic!() };
        assert_eq!((dm.channel.as_str(), dm.sender.as_str(), dm.text.as_str()), ("alice", "alice", "yes"));
        assert!(dm.parsed_timestamp().is_ok());

        let Some(TransportEvent::Message(group)) = events.recv().await else { panic!() };
        assert_eq!(group.channel.as_str(), "#team");
        assert!(tokio::time::timeout(Duration::from_millis(100), events.recv()).await.is_err());
    }

    #[tokio::test]
    async fn history_replay_is_ignored() {
        let mut h = start();
        register(&mut h).await;
        let (tx, mut events) = mpsc::channel(8);
        h.shared.set_listener(Some(tx));

        h.server.send(":srv BATCH +h1 chathistory alice").await;
        h.server.send("@batch=h1 :alice!a@host PRIVMSG standup :old news").await;
        h.server.send(":srv BATCH -h1").await;
        h.server.send(":alice!a@host PRIVMSG standup :fresh").await;

        let Some(TransportEvent::Message(m)) = events.recv().await else { panic!() };
        assert_eq!(m.text, "fresh");
    }

    #[tokio::test]
    async fn names_are_collected_until_end_of_list() {
        let mut h = start();
        register(&mut h).await;
        let names = h.shared.await_names("#Team");
        h.server.send(":srv 353 standup = #team :@alice +bob").await;
        h.server.send(":srv 353 standup = #team :carol standup").await;
        h.server.send(":srv 366 standup #team :End of /NAMES list").await;
        assert_eq!(names.await.unwrap(), vec!["@alice", "+bob", "carol", "standup"]);
    }

    #[tokio::test]
    async fn commands_are_written_and_quit_ends_the_session() {
        let mut h = start();
        register(&mut h).await;
        h.cmd_tx
            .send(Command::Privmsg { target: "alice".into(), text: "line one\nline two".into() })
            .await
            .unwrap();
        assert_eq!(h.server.expect("PRIVMSG").await, "PRIVMSG alice :line one");
        assert_eq!(h.server.expect("PRIVMSG").await, "PRIVMSG alice :line two");
        h.cmd_tx.send(Command::Quit("bye".into())).await.unwrap();
        assert_eq!(h.server.expect("QUIT").await, "QUIT bye");
        h.task.await.unwrap();

        let mut rest = String::new();
        h.server.from_client.read_to_string(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
