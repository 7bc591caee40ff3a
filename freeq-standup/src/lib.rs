//! freeq-standup: a daily standup survey bot for freeq IRC.
//!
//! Every member of a channel gets a short private conversation (ready?
//! yesterday, today, done by when, blockers) and the answers are posted
//! back to the channel as one summary.
//!
//! - [`conversation`]: per-participant state machine
//! - [`correlator`]: matches replies to the question they answer
//! - [`dispatch`]: fans inbound messages out to pending questions
//! - [`run`]: one survey across everyone, with quorum and deadline
//! - [`irc`]: the IRC [`transport::Transport`]

pub mod backoff;
pub mod config;
pub mod conversation;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod irc;
pub mod report;
pub mod run;
pub mod schedule;
pub mod standup;
pub mod testing;
pub mod transport;
