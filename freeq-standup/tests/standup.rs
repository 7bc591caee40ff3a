//! A full day's standup: survey, summary, delivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

use freeq_standup::backoff::Backoff;
use freeq_standup::report::{self, Delivered, Delivery};
use freeq_standup::run::{EndReason, RunConfig};
use freeq_standup::standup::Standup;
use freeq_standup::testing::{Reply, ScriptedTransport, say};
use freeq_standup::transport::{ChannelId, Participant};

fn fast_delivery(attempts: u32) -> Delivery {
    Delivery {
        attempts,
        backoff: Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(40),
            factor: 2.0,
        },
    }
}

fn standup(deadline: Duration) -> Standup {
    Standup {
        channel: ChannelId::new("#team"),
        report_channel: ChannelId::new("#standup-log"),
        run: RunConfig {
            deadline,
            question_timeout: Duration::from_secs(2),
            ..RunConfig::default()
        },
        delivery: fast_delivery(5),
    }
}

fn answers(a: [&str; 4]) -> Vec<Reply> {
    let mut replies = vec![say("Yes")];
    replies.extend(a.map(say));
    replies
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
}

#[tokio::test]
async fn one_declines_two_answer() {
    let transport = ScriptedTransport::new()
        .participant(Participant::member("p1"), vec![say("no")])
        .participant(
            Participant::member("p2"),
            answers(["reviewed PRs", "release notes", "by lunch", "nothing"]),
        )
        .participant(
            Participant::member("p3"),
            answers(["on-call", "postmortem", "end of day", "waiting on infra"]),
        );

    let summary = standup(Duration::from_secs(10))
        .run_once(Arc::new(transport.clone()), date(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.outcome.reason, EndReason::Quorum);
    assert!(summary.outcome.elapsed < Duration::from_secs(5));
    assert_eq!(summary.delivered, Delivered::Channel);

    let posted = transport.sent_to(&ChannelId::new("#standup-log"));
    assert_eq!(
        posted,
        vec![
            "Standup for Friday 2026-10-16: 2 answered, 1 declined, 0 incomplete",
            "p1: declined",
            "p2",
            "  Yesterday: reviewed PRs",
            "  Today: release notes",
            "  Done by: by lunch",
            "  Blockers: nothing",
            "p3",
            "  Yesterday: on-call",
            "  Today: postmortem",
            "  Done by: end of day",
            "  Blockers: waiting on infra",
        ]
    );
}

#[tokio::test]
async fn cancelled_standup_still_posts_what_it_has() {
    let transport = ScriptedTransport::new()
        .participant(Participant::member("p1"), vec![say("yes"), say("half done"), Reply::Silent]);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        });
    }

    let summary = standup(Duration::from_secs(60))
        .run_once(Arc::new(transport.clone()), date(), &cancel)
        .await
        .unwrap();

    assert_eq!(summary.outcome.reason, EndReason::Cancelled);
    let posted = transport.sent_to(&ChannelId::new("#standup-log"));
    assert_eq!(posted[0], "Standup for Friday 2026-10-16: 0 answered, 0 declined, 1 incomplete");
    assert_eq!(posted[1], "p1 (incomplete)");
    assert_eq!(posted[2], "  Yesterday: half done");
}

#[tokio::test]
async fn delivery_resumes_at_the_failed_line() {
    let transport = ScriptedTransport::new();
    let channel = ChannelId::new("#standup-log");
    let lines: Vec<String> = ["header", "alice", "bob"].map(String::from).to_vec();

    transport.fail_after(1, 2);
    let delivered = report::post(&transport, &channel, &lines, fast_delivery(5)).await;

    assert_eq!(delivered, Delivered::Channel);
    assert_eq!(transport.sent_to(&channel), lines);
}

#[tokio::test]
async fn delivery_gives_up_without_failing() {
    let transport = ScriptedTransport::new();
    let channel = ChannelId::new("#standup-log");
    let lines = vec!["header".to_string()];

    transport.fail_next_sends(100);
    let started = tokio::time::Instant::now();
    let delivered = report::post(&transport, &channel, &lines, fast_delivery(3)).await;

    assert_eq!(delivered, Delivered::LogOnly);
    assert!(transport.sent_to(&channel).is_empty());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn member_list_failure_is_the_only_error() {
    struct NoMembers;

    #[async_trait::async_trait]
    impl freeq_standup::transport::Transport for NoMembers {
        async fn list_members(
            &self,
            _channel: &ChannelId,
        ) -> Result<Vec<Participant>, freeq_standup::error::TransportError> {
            Err(freeq_standup::error::TransportError::NotConnected)
        }
        async fn open_direct_channel(
            &self,
            participant: &freeq_standup::transport::ParticipantId,
        ) -> Result<ChannelId, freeq_standup::error::TransportError> {
            Ok(ChannelId::new(participant.as_str()))
        }
        async fn send_message(
            &self,
            _channel: &ChannelId,
            _text: &str,
        ) -> Result<chrono::DateTime<chrono::Utc>, freeq_standup::error::TransportError> {
            Ok(chrono::Utc::now())
        }
        async fn connect(
            &self,
        ) -> Result<
            tokio::sync::mpsc::Receiver<freeq_standup::transport::TransportEvent>,
            freeq_standup::error::TransportError,
        > {
            Err(freeq_standup::error::TransportError::NotConnected)
        }
        async fn disconnect(&self) -> Result<(), freeq_standup::error::TransportError> {
            Ok(())
        }
    }

    let result = standup(Duration::from_secs(1))
        .run_once(Arc::new(NoMembers), date(), &CancellationToken::new())
        .await;
    assert!(matches!(
        result,
        Err(freeq_standup::error::TransportError::NotConnected)
    ));
}
