//! One day's standup from start to posted summary.

use std::sync::Arc;

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::report::{self, Delivered, Delivery};
use crate::run::{Run, RunConfig, RunOutcome};
use crate::transport::{ChannelId, Transport};

/// Where to ask, where to report, and how.
#[derive(Debug, Clone)]
pub struct Standup {
    /// Channel whose members are surveyed.
    pub channel: ChannelId,
    /// Channel the summary goes to.
    pub report_channel: ChannelId,
    pub run: RunConfig,
    pub delivery: Delivery,
}

/// A finished standup.
#[derive(Debug)]
pub struct Summary {
    pub outcome: RunOutcome,
    pub delivered: Delivered,
}

impl Standup {
    /// List members, survey them, and post the summary dated `date`.
    ///
    /// Fails only if the member list can't be fetched. Cancelling `cancel`
    /// cuts the survey short; the partial summary is still posted.
    pub async fn run_once(
        &self,
        transport: Arc<dyn Transport>,
        date: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<Summary, TransportError> {
        let members = transport.list_members(&self.channel).await?;
        tracing::info!(channel = %self.channel, members = members.len(), %date, "Starting standup");

        let outcome = Run::new(Arc::clone(&transport), self.run.clone(), members)
            .cancelled_by(cancel)
            .start()
            .await;
        tracing::info!(
            reason = %outcome.reason,
            completed = outcome.completed(),
            participants = outcome.conversations.len(),
            elapsed_secs = outcome.elapsed.as_secs(),
            "Standup finished"
        );
        match serde_json::to_string(&outcome) {
            Ok(json) => tracing::debug!(outcome = %json, "Standup results"),
            Err(e) => tracing::debug!(error = %e, "Could not serialize results"),
        }

        let lines = report::render(&outcome, date);
        let delivered = report::post(transport.as_ref(), &self.report_channel, &lines, self.delivery).await;
        Ok(Summary { outcome, delivered })
    }
}
