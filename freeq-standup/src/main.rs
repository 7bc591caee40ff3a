//! freeq-standup: daily standup survey bot for freeq IRC.
//!
//! At the configured time the bot DMs every member of the channel:
//!
//!   ready? → yesterday → today → done by when → blockers
//!
//! and posts everyone's answers to the report channel once all have
//! finished or the deadline passes. `--once` runs a single standup now.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use freeq_standup::backoff::Backoff;
use freeq_standup::config::{self, Cli, FileConfig, Resolved};
use freeq_standup::irc::{IrcConfig, IrcTransport};
use freeq_standup::report::Delivery;
use freeq_standup::schedule::Schedule;
use freeq_standup::standup::Standup;
use freeq_standup::transport::{ChannelId, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "freeq_standup=info".into());
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let path = cli.config.clone().unwrap_or_else(config::default_path);
    let file = FileConfig::load(&path)?;
    let settings = Resolved::merge(&cli, &file).context("Invalid configuration")?;

    tracing::info!(
        server = %settings.server,
        nick = %settings.nick,
        channel = %settings.channel,
        report_channel = %settings.report_channel,
        "Starting freeq-standup"
    );

    let transport: Arc<dyn Transport> = Arc::new(IrcTransport::new(IrcConfig {
        server_addr: settings.server.clone(),
        nick: settings.nick.clone(),
        tls: settings.tls,
        bots: settings.bots.clone(),
    }));
    let standup = Standup {
        channel: ChannelId::new(settings.channel.clone()),
        report_channel: ChannelId::new(settings.report_channel.clone()),
        run: settings.run.clone(),
        delivery: Delivery {
            attempts: settings.report_attempts,
            backoff: Backoff::default(),
        },
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received, wrapping up");
                shutdown.cancel();
            }
        });
    }

    if settings.once {
        let date = Local::now().date_naive();
        standup
            .run_once(Arc::clone(&transport), date, &shutdown)
            .await
            .context("Standup failed")?;
    } else {
        scheduled(&settings, &standup, &transport, &shutdown).await;
    }

    if let Err(e) = transport.disconnect().await {
        tracing::debug!(error = %e, "Disconnect on shutdown failed");
    }
    Ok(())
}

/// Run a standup at every scheduled start until shut down.
async fn scheduled(
    settings: &Resolved,
    standup: &Standup,
    transport: &Arc<dyn Transport>,
    shutdown: &CancellationToken,
) {
    let mut schedule = Schedule::new(settings.at, settings.weekdays_only);
    loop {
        let now = Local::now().naive_local();
        let next = schedule.next_start(now);
        let wait = (next - now).to_std().unwrap_or_default();
        tracing::info!(%next, wait_mins = wait.as_secs() / 60, "Next standup scheduled");

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let date = Local::now().date_naive();
        schedule.mark_ran(date);
        if let Err(e) = standup.run_once(Arc::clone(transport), date, shutdown).await {
            tracing::error!(error = %e, %date, "Standup failed");
        }
        if shutdown.is_cancelled() {
            return;
        }
    }
}
