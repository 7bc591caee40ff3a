//! Question/answer correlation through a live dispatcher.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use freeq_standup::correlator::Correlator;
use freeq_standup::dispatch::{Dispatcher, HandlerRegistry};
use freeq_standup::error::AskError;
use freeq_standup::testing::{Reply, ScriptedTransport, say};
use freeq_standup::transport::{InboundMessage, Participant, ParticipantId, TransportEvent, format_timestamp};

struct Fixture {
    transport: ScriptedTransport,
    registry: Arc<HandlerRegistry>,
    correlator: Arc<Correlator>,
    cancel: CancellationToken,
}

async fn fixture(replies: Vec<Reply>) -> Fixture {
    let transport = ScriptedTransport::new().participant(Participant::member("alice"), replies);
    let registry = Arc::new(HandlerRegistry::new());
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(Arc::new(transport.clone()), Arc::clone(&registry));
    let mut sessions = dispatcher.sessions();
    tokio::spawn(dispatcher.run(cancel.clone()));
    sessions.wait_for(|n| *n > 0).await.unwrap();

    let correlator = Arc::new(Correlator::new(Arc::new(transport.clone()), Arc::clone(&registry)));
    Fixture {
        transport,
        registry,
        correlator,
        cancel,
    }
}

fn alice() -> ParticipantId {
    ParticipantId::new("alice")
}

fn from_alice(text: &str, timestamp: String) -> TransportEvent {
    TransportEvent::Message(InboundMessage {
        channel: ScriptedTransport::direct_channel(&alice()),
        sender: alice(),
        text: text.to_string(),
        timestamp,
    })
}

#[tokio::test]
async fn stale_event_leaves_the_question_pending() {
    let f = fixture(vec![Reply::Silent]).await;
    let correlator = Arc::clone(&f.correlator);
    let cancel = f.cancel.clone();
    let mut pending = tokio::spawn(async move {
        correlator
            .send_and_await(&alice(), "what did you do yesterday?", Duration::from_secs(5), &cancel)
            .await
    });

    // Wait until the question is out, then replay something older
    while f.transport.sent().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let old = format_timestamp(Utc::now() - chrono::Duration::minutes(10));
    assert!(f.transport.inject(from_alice("last week's answer", old)).await);
    assert!(
        tokio::time::timeout(Duration::from_millis(150), &mut pending).await.is_err(),
        "a stale event must not resolve the question"
    );

    assert!(f.transport.inject(from_alice("today's answer", format_timestamp(Utc::now()))).await);
    let answer = pending.await.unwrap().unwrap();
    assert_eq!(answer, "today's answer");
    assert!(f.registry.is_empty(), "handler must be removed once resolved");
}

#[tokio::test]
async fn second_question_for_the_same_participant_is_refused() {
    let f = fixture(vec![Reply::After(Duration::from_millis(200), "first".into())]).await;
    let correlator = Arc::clone(&f.correlator);
    let cancel = f.cancel.clone();
    let first = tokio::spawn(async move {
        correlator
            .send_and_await(&alice(), "one", Duration::from_secs(5), &cancel)
            .await
    });
    while f.transport.sent().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let second = f
        .correlator
        .send_and_await(&alice(), "two", Duration::from_secs(5), &f.cancel)
        .await;
    assert!(matches!(second, Err(AskError::Busy(_))));
    assert_eq!(first.await.unwrap().unwrap(), "first");
}

#[tokio::test]
async fn timeout_cleans_up_its_handler() {
    let f = fixture(vec![Reply::Silent]).await;
    let wait = Duration::from_millis(100);
    let result = f.correlator.send_and_await(&alice(), "hello?", wait, &f.cancel).await;
    assert!(matches!(result, Err(AskError::Timeout(w)) if w == wait));
    assert!(f.registry.is_empty());
}

#[tokio::test]
async fn cancellation_interrupts_the_wait() {
    let f = fixture(vec![Reply::Silent]).await;
    let cancel = f.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let started = tokio::time::Instant::now();
    let result = f
        .correlator
        .send_and_await(&alice(), "hello?", Duration::from_secs(30), &f.cancel)
        .await;
    assert!(matches!(result, Err(AskError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn failed_send_is_reported() {
    let f = fixture(vec![say("never heard")]).await;
    f.transport.fail_next_sends(1);
    let result = f
        .correlator
        .send_and_await(&alice(), "hello?", Duration::from_secs(1), &f.cancel)
        .await;
    assert!(matches!(result, Err(AskError::SendFailed(_))));
    assert!(f.registry.is_empty());
}

#[tokio::test]
async fn other_peoples_messages_are_ignored() {
    let f = fixture(vec![Reply::Silent]).await;
    let correlator = Arc::clone(&f.correlator);
    let cancel = f.cancel.clone();
    let pending = tokio::spawn(async move {
        correlator
            .send_and_await(&alice(), "ready?", Duration::from_secs(5), &cancel)
            .await
    });
    while f.transport.sent().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let now = || format_timestamp(Utc::now());
    f.transport
        .inject(TransportEvent::Message(InboundMessage {
            channel: ScriptedTransport::direct_channel(&alice()),
            sender: ParticipantId::new("mallory"),
            text: "yes".into(),
            timestamp: now(),
        }))
        .await;
    f.transport
        .inject(TransportEvent::Message(InboundMessage {
            channel: freeq_standup::transport::ChannelId::new("#standup"),
            sender: alice(),
            text: "no".into(),
            timestamp: now(),
        }))
        .await;
    f.transport.inject(from_alice("yes", now())).await;

    assert_eq!(pending.await.unwrap().unwrap(), "yes");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn earlier_of_two_quick_replies_is_the_answer() {
    const ROUNDS: usize = 100;
    let f = fixture(vec![Reply::Silent; ROUNDS]).await;

    for round in 0..ROUNDS {
        let correlator = Arc::clone(&f.correlator);
        let cancel = f.cancel.clone();
        let pending = tokio::spawn(async move {
            correlator
                .send_and_await(&alice(), "anything else?", Duration::from_secs(5), &cancel)
                .await
        });
        while f.transport.sent().len() <= round {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let base = Utc::now() + chrono::Duration::milliseconds(1);
        f.transport.inject(from_alice("first", format_timestamp(base))).await;
        f.transport
            .inject(from_alice("second", format_timestamp(base + chrono::Duration::milliseconds(1))))
            .await;

        assert_eq!(pending.await.unwrap().unwrap(), "first", "round {round}");
        // Let "second" fall behind the next question's send time
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
