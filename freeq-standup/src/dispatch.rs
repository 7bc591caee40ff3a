//! Inbound event fan-out.
//!
//! [`Dispatcher`] owns the transport's listening session for the lifetime of
//! a run and hands every inbound message to each handler currently in the
//! [`HandlerRegistry`]. Handlers come and go constantly: every pending
//! question registers one and removes it as soon as it resolves.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::transport::{InboundMessage, Transport, TransportEvent};

/// A message handler. Runs on the dispatch loop, so it must not block;
/// anything slow belongs in a task.
pub type Handler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Registration key returned by [`HandlerRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Concurrent-safe map of live handlers.
///
/// `register` and `unregister` are the only mutators; the lock is held just
/// long enough to touch the map, never while a handler runs.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<HandlerId, Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().insert(id, Arc::new(handler));
        id
    }

    /// Returns whether the handler was still registered.
    pub fn unregister(&self, id: HandlerId) -> bool {
        self.handlers.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every registered handler with `message`, in registration order.
    ///
    /// Handlers run inline on the caller, so each one sees messages in the
    /// order they arrived. A panicking handler is logged and skipped.
    pub fn dispatch(&self, message: InboundMessage) {
        let handlers: Vec<(HandlerId, Handler)> = self
            .handlers
            .lock()
            .iter()
            .map(|(id, handler)| (*id, Arc::clone(handler)))
            .collect();
        for (id, handler) in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&message))).is_err() {
                tracing::error!(handler = id.0, sender = %message.sender, "Message handler panicked");
            }
        }
    }
}

/// What to do when the listening session drops mid-run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Reconnect with backoff until the run ends.
    #[default]
    WhileActive,
    /// Treat any disconnect as the end of listening.
    Never,
}

/// Drives the transport's inbound stream into a [`HandlerRegistry`].
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    policy: ReconnectPolicy,
    backoff: Backoff,
    sessions: watch::Sender<u32>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            transport,
            registry,
            policy: ReconnectPolicy::default(),
            backoff: Backoff::default(),
            sessions: watch::Sender::new(0),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Count of sessions opened so far. Closes when [`Dispatcher::run`] returns.
    pub fn sessions(&self) -> watch::Receiver<u32> {
        self.sessions.subscribe()
    }

    /// Listen until `cancel` fires, then close the session.
    ///
    /// Returns the number of sessions that were opened.
    pub async fn run(self, cancel: CancellationToken) -> u32 {
        let mut sessions = 0u32;
        let mut delay = self.backoff.initial;

        'session: loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break 'session,
                result = self.transport.connect() => result,
            };

            let mut events = match connected {
                Ok(events) => {
                    sessions += 1;
                    self.sessions.send_replace(sessions);
                    delay = self.backoff.initial;
                    tracing::debug!(session = sessions, "Listening for inbound events");
                    events
                }
                Err(e) => {
                    tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "Connect failed");
                    if self.policy == ReconnectPolicy::Never || !self.pause(delay, &cancel).await {
                        break 'session;
                    }
                    delay = self.backoff.next(delay);
                    continue 'session;
                }
            };

            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'session,
                    event = events.recv() => event,
                };

                match event {
                    Some(TransportEvent::Message(message)) => self.registry.dispatch(message),
                    Some(TransportEvent::Error(text)) => {
                        tracing::warn!(error = %text, "Transport reported an error");
                    }
                    Some(TransportEvent::Disconnected { reason }) => {
                        if !self.after_disconnect(&reason, &mut delay, &cancel).await {
                            break 'session;
                        }
                        continue 'session;
                    }
                    None => {
                        if !self.after_disconnect("event stream closed", &mut delay, &cancel).await {
                            break 'session;
                        }
                        continue 'session;
                    }
                }
            }
        }

        if let Err(e) = self.transport.disconnect().await {
            tracing::debug!(error = %e, "Disconnect after run end failed");
        }
        tracing::debug!(sessions, "Event dispatch stopped");
        sessions
    }

    /// Decide whether to reconnect. Returns `false` when listening should end.
    async fn after_disconnect(
        &self,
        reason: &str,
        delay: &mut std::time::Duration,
        cancel: &CancellationToken,
    ) -> bool {
        if cancel.is_cancelled() {
            tracing::info!(reason, "Disconnected after run end");
            return false;
        }
        if self.policy == ReconnectPolicy::Never {
            tracing::warn!(reason, "Disconnected, reconnect disabled");
            return false;
        }
        tracing::info!(reason, delay_ms = delay.as_millis() as u64, "Disconnected, will reconnect");
        if !self.pause(*delay, cancel).await {
            return false;
        }
        *delay = self.backoff.next(*delay);
        true
    }

    /// Sleep for `delay` unless cancelled first. Returns `false` on cancel.
    async fn pause(&self, delay: std::time::Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
