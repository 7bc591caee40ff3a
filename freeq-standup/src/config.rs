//! Command line and config file.
//!
//! Config file lives at `~/.config/freeq/standup.toml`. Values resolve as
//! CLI (or `STANDUP_*` environment) > config file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use clap::Parser;
use serde::Deserialize;

use crate::conversation::{ReadinessFallback, ReadinessPolicy};
use crate::dispatch::ReconnectPolicy;
use crate::error::ConfigError;
use crate::run::RunConfig;

/// Default IRC server.
pub const DEFAULT_SERVER: &str = "irc.freeq.at:6697";
/// Default nick for the bot.
pub const DEFAULT_NICK: &str = "standup";
/// Default channel to survey.
pub const DEFAULT_CHANNEL: &str = "#standup";
/// Default start time.
pub const DEFAULT_AT: &str = "09:30";

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "freeq-standup", about = "Daily standup survey bot for freeq")]
pub struct Cli {
    /// Config file (default: ~/.config/freeq/standup.toml)
    #[arg(long, env = "STANDUP_CONFIG")]
    pub config: Option<PathBuf>,

    /// IRC server address (host:port)
    #[arg(long, env = "STANDUP_SERVER")]
    pub server: Option<String>,

    /// Bot nickname
    #[arg(long, env = "STANDUP_NICK")]
    pub nick: Option<String>,

    /// Channel whose members are surveyed
    #[arg(long, env = "STANDUP_CHANNEL")]
    pub channel: Option<String>,

    /// Channel the summary is posted to (default: the surveyed channel)
    #[arg(long, env = "STANDUP_REPORT_CHANNEL")]
    pub report_channel: Option<String>,

    /// Force TLS (auto-enabled on port 6697)
    #[arg(long, env = "STANDUP_TLS")]
    pub tls: bool,

    /// Local start time, HH:MM
    #[arg(long, env = "STANDUP_AT")]
    pub at: Option<String>,

    /// Skip Saturdays and Sundays
    #[arg(long, env = "STANDUP_WEEKDAYS_ONLY")]
    pub weekdays_only: bool,

    /// How long a run may last
    #[arg(long, env = "STANDUP_DEADLINE_MINUTES")]
    pub deadline_minutes: Option<u64>,

    /// How long to wait for any one answer
    #[arg(long, env = "STANDUP_QUESTION_TIMEOUT_MINUTES")]
    pub question_timeout_minutes: Option<u64>,

    /// Other bots in the channel, comma-separated (never surveyed)
    #[arg(long, env = "STANDUP_BOTS")]
    pub bots: Option<String>,

    /// Run once now instead of on a schedule
    #[arg(long, env = "STANDUP_ONCE")]
    pub once: bool,

    /// Log JSON lines instead of the human format
    #[arg(long, env = "STANDUP_LOG_JSON")]
    pub log_json: bool,
}

/// Contents of `standup.toml`. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub server: Option<String>,
    pub nick: Option<String>,
    pub channel: Option<String>,
    pub report_channel: Option<String>,
    pub tls: Option<bool>,
    pub at: Option<String>,
    pub weekdays_only: Option<bool>,
    pub deadline_minutes: Option<u64>,
    pub question_timeout_minutes: Option<u64>,
    pub bots: Option<Vec<String>>,
    /// Clarifications at the readiness gate before falling back.
    pub max_clarifications: Option<u32>,
    pub readiness_fallback: Option<ReadinessFallback>,
    /// `false` ends listening at the first disconnect.
    pub reconnect: Option<bool>,
    /// Attempts at posting the summary before logging it instead.
    pub report_attempts: Option<u32>,
}

impl FileConfig {
    /// Read `path`. A missing file is an empty config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// `~/.config/freeq/standup.toml`, or `./standup.toml` without a home dir.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".config").join("freeq"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("standup.toml")
}

/// Effective settings after merging.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub server: String,
    pub nick: String,
    pub channel: String,
    pub report_channel: String,
    pub tls: bool,
    pub at: NaiveTime,
    pub weekdays_only: bool,
    pub bots: Vec<String>,
    pub once: bool,
    pub run: RunConfig,
    pub report_attempts: u32,
}

impl Resolved {
    /// Merge: CLI overrides > config file > defaults.
    pub fn merge(cli: &Cli, file: &FileConfig) -> Result<Self, ConfigError> {
        let server = cli
            .server
            .clone()
            .or_else(|| file.server.clone())
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());
        // Default to the TLS port when none is given
        let server = if server.contains(':') {
            server
        } else {
            format!("{server}:6697")
        };
        let tls = cli.tls || file.tls.unwrap_or(false) || server.ends_with(":6697");

        let nick = cli
            .nick
            .clone()
            .or_else(|| file.nick.clone())
            .unwrap_or_else(|| DEFAULT_NICK.to_string());
        let channel = normalize_channel(
            cli.channel
                .as_deref()
                .or(file.channel.as_deref())
                .unwrap_or(DEFAULT_CHANNEL),
        );
        let report_channel = cli
            .report_channel
            .as_deref()
            .or(file.report_channel.as_deref())
            .map(normalize_channel)
            .unwrap_or_else(|| channel.clone());

        let at = parse_time_of_day(cli.at.as_deref().or(file.at.as_deref()).unwrap_or(DEFAULT_AT))?;
        let weekdays_only = cli.weekdays_only || file.weekdays_only.unwrap_or(false);

        let bots = match (&cli.bots, &file.bots) {
            (Some(list), _) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            (None, Some(list)) => list.clone(),
            (None, None) => Vec::new(),
        };

        let defaults = RunConfig::default();
        let deadline = minutes(
            "deadline_minutes",
            cli.deadline_minutes.or(file.deadline_minutes),
            defaults.deadline,
        )?;
        let question_timeout = minutes(
            "question_timeout_minutes",
            cli.question_timeout_minutes.or(file.question_timeout_minutes),
            defaults.question_timeout,
        )?;

        let mut readiness = ReadinessPolicy::default();
        if let Some(n) = file.max_clarifications {
            readiness.max_clarifications = n;
        }
        if let Some(fallback) = file.readiness_fallback {
            readiness.fallback = fallback;
        }
        let reconnect = match file.reconnect {
            Some(false) => ReconnectPolicy::Never,
            _ => ReconnectPolicy::WhileActive,
        };

        let report_attempts = file.report_attempts.unwrap_or(5);
        if report_attempts == 0 {
            return Err(ConfigError::Zero("report_attempts"));
        }

        Ok(Self {
            server,
            nick,
            channel,
            report_channel,
            tls,
            at,
            weekdays_only,
            bots,
            once: cli.once,
            run: RunConfig {
                deadline,
                question_timeout,
                readiness,
                reconnect,
                ..defaults
            },
            report_attempts,
        })
    }
}

/// Parse `HH:MM` (24-hour).
pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|_| ConfigError::TimeOfDay(raw.to_string()))
}

fn minutes(name: &'static str, value: Option<u64>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Zero(name)),
        Some(m) => Ok(Duration::from_secs(m * 60)),
        None => Ok(default),
    }
}

fn normalize_channel(name: &str) -> String {
    let name = name.trim();
    if name.starts_with('#') || name.starts_with('&') {
        name.to_string()
    } else {
        format!("#{name}")
    }
}
