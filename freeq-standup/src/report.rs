//! Standup summary: rendering and delivery.
//!
//! The summary is plain chat lines, one block per participant. Delivery
//! retries with backoff and never fails the run; if the channel can't be
//! reached the summary ends up in the log instead.

use chrono::NaiveDate;

use crate::backoff::Backoff;
use crate::conversation::Conversation;
use crate::run::RunOutcome;
use crate::transport::{ChannelId, Transport};

/// Longest line we post, in bytes; longer answers are wrapped.
const MAX_LINE: usize = 400;

/// Placeholder for a question that never got an answer.
const UNANSWERED: &str = "";

/// How hard to try posting the summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delivery {
    /// Failed sends tolerated before giving up.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for Delivery {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Backoff::default(),
        }
    }
}

/// Where the summary ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    Channel,
    LogOnly,
}

/// Render the whole summary.
pub fn render(outcome: &RunOutcome, date: NaiveDate) -> Vec<String> {
    let mut conversations: Vec<&Conversation> = outcome.conversations.values().collect();
    conversations.sort_by(|a, b| {
        a.participant()
            .display_name
            .to_lowercase()
            .cmp(&b.participant().display_name.to_lowercase())
    });

    let declined = conversations.iter().filter(|c| c.is_declined()).count();
    let answered = conversations
        .iter()
        .filter(|c| c.is_complete() && !c.is_declined())
        .count();
    let incomplete = conversations.len() - answered - declined;

    let mut lines = vec![format!(
        "Standup for {}: {answered} answered, {declined} declined, {incomplete} incomplete",
        date.format("%A %Y-%m-%d")
    )];
    if conversations.is_empty() {
        lines.push("Nobody to ask today.".to_string());
    }
    for conversation in conversations {
        lines.extend(render_block(conversation));
    }
    lines
}

/// One participant's block.
pub fn render_block(conversation: &Conversation) -> Vec<String> {
    let name = &conversation.participant().display_name;
    if conversation.is_declined() {
        return vec![format!("{name}: declined")];
    }

    let answers = conversation.answers();
    let mut lines = vec![if conversation.is_complete() {
        name.clone()
    } else {
        format!("{name} (incomplete)")
    }];
    for (label, answer) in [
        ("Yesterday", &answers.yesterday),
        ("Today", &answers.today),
        ("Done by", &answers.finish_time),
        ("Blockers", &answers.blockers),
    ] {
        let text = answer.as_deref().map(flatten).unwrap_or_else(|| UNANSWERED.to_string());
        let line = format!("  {label}: {text}");
        lines.extend(wrap_lines(line.trim_end(), MAX_LINE));
    }
    lines
}

/// Post `lines` to `channel`, resuming at the failed line after each backoff.
pub async fn post(
    transport: &dyn Transport,
    channel: &ChannelId,
    lines: &[String],
    delivery: Delivery,
) -> Delivered {
    let mut failures = 0u32;
    let mut delays = delivery.backoff.delays();
    let mut next = 0usize;

    while next < lines.len() {
        match transport.send_message(channel, &lines[next]).await {
            Ok(_) => next += 1,
            Err(e) => {
                failures += 1;
                if failures >= delivery.attempts {
                    tracing::error!(
                        channel = %channel,
                        error = %e,
                        failures,
                        "Giving up on posting the standup summary"
                    );
                    for line in lines {
                        tracing::warn!(target: "freeq_standup::report", "{line}");
                    }
                    return Delivered::LogOnly;
                }
                let delay = delays.next().unwrap_or(delivery.backoff.max);
                tracing::warn!(
                    channel = %channel,
                    error = %e,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "Posting summary failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    tracing::info!(channel = %channel, lines = lines.len(), "Standup summary posted");
    Delivered::Channel
}

/// Chat lines can't contain line breaks.
fn flatten(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Continuation lines start with this.
const CONTINUATION: &str = "    ";

/// Wrap text into lines of at most `max_len` bytes, breaking on word
/// boundaries. Words too long for a line are split between characters.
fn wrap_lines(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let piece = max_len.saturating_sub(CONTINUATION.len()).max(1);
    let mut result = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace().flat_map(|w| split_word(w, piece)) {
        if !current.is_empty() && current.len() + word.len() + 1 > max_len {
            result.push(std::mem::take(&mut current));
            current.push_str(CONTINUATION);
        } else if !current.is_empty() && !current.ends_with(' ') {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.trim().is_empty() {
        result.push(current);
    }
    result
}

/// Cut `word` into pieces of at most `limit` bytes on char boundaries.
/// A single char wider than `limit` still gets a piece of its own.
fn split_word(word: &str, limit: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = word;
    while rest.len() > limit {
        let mut cut = limit;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        rest = tail;
    }
    pieces.push(rest);
    pieces
}
