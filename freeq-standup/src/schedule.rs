//! When the next standup starts.
//!
//! Times are local wall-clock times. The date of the last run lives only in
//! this process; a restart forgets it.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};

/// How late a missed start may still be caught up on the same day.
pub const CATCH_UP_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
pub struct Schedule {
    at: NaiveTime,
    weekdays_only: bool,
    last_run: Option<NaiveDate>,
}

impl Schedule {
    pub fn new(at: NaiveTime, weekdays_only: bool) -> Self {
        Self {
            at,
            weekdays_only,
            last_run: None,
        }
    }

    pub fn last_run(&self) -> Option<NaiveDate> {
        self.last_run
    }

    /// Remember that a run started on `date`.
    pub fn mark_ran(&mut self, date: NaiveDate) {
        self.last_run = Some(date);
    }

    /// The next start at or after `now`.
    ///
    /// Today counts if it is eligible, hasn't run yet, and `now` is no more
    /// than [`CATCH_UP_MINUTES`] past the start time; a late start begins at `now`.
    pub fn next_start(&self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date();
        let start_today = today.and_time(self.at);
        if self.eligible(today) && now <= start_today + Duration::minutes(CATCH_UP_MINUTES) {
            return start_today.max(now);
        }

        let mut day = today;
        loop {
            day = match day.succ_opt() {
                Some(next) => next,
                None => return NaiveDateTime::MAX,
            };
            if self.eligible(day) {
                return day.and_time(self.at);
            }
        }
    }

    fn eligible(&self, day: NaiveDate) -> bool {
        if self.last_run == Some(day) {
            return false;
        }
        !(self.weekdays_only && matches!(day.weekday(), Weekday::Sat | Weekday::Sun))
    }
}
