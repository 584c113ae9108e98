// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Reboot window parsing and evaluation.
//!
//! The operator only admits new nodes into the reboot pipeline while the
//! configured window is open. A window is a repeating interval described by a
//! start, an optional weekday plus a wall-clock time such as `"Mon 14:00"`
//! or `"11:00"`, and a length such as `"1h30m"`. With a weekday the window
//! repeats weekly; without one it repeats daily. An unconfigured (empty)
//! start means the window is always open.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Local, NaiveTime, Timelike, Weekday};
use std::time::Duration;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
const SECONDS_PER_WEEK: u64 = 7 * SECONDS_PER_DAY;

/// A repeating reboot window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RebootWindow {
    start_day: Option<Weekday>,
    start_time: NaiveTime,
    length: Duration,
}

impl RebootWindow {
    /// Parse a reboot window from its start and length strings.
    ///
    /// Returns `Ok(None)` when `start` is empty: no window is configured and
    /// admissions are always allowed.
    ///
    /// # Errors
    ///
    /// Fails when the start cannot be parsed as `[Weekday ]HH:MM`, the length
    /// is not a valid duration, or the length does not fit into the window's
    /// repetition period.
    pub fn parse(start: &str, length: &str) -> Result<Option<Self>> {
        let start = start.trim();
        if start.is_empty() {
            return Ok(None);
        }

        let (start_day, time_str) = match start.split_once(' ') {
            Some((day, time)) => {
                let day = day
                    .parse::<Weekday>()
                    .map_err(|_| anyhow::anyhow!("invalid weekday {day:?} in reboot window start"))?;

                (Some(day), time.trim())
            }
            None => (None, start),
        };

        let start_time = NaiveTime::parse_from_str(time_str, "%H:%M")
            .with_context(|| format!("invalid time of day {time_str:?} in reboot window start"))?;

        let length = humantime::parse_duration(length.trim())
            .with_context(|| format!("invalid reboot window length {length:?}"))?;

        let window = Self {
            start_day,
            start_time,
            length,
        };

        if length.as_secs() > window.period_seconds() {
            bail!(
                "reboot window length {length:?} exceeds the window's repetition period"
            );
        }

        Ok(Some(window))
    }

    /// Whether the window is open at the given local time.
    #[must_use]
    pub fn is_open(&self, now: &DateTime<Local>) -> bool {
        self.is_open_at(now.weekday(), now.time())
    }

    /// Whether the window is currently open.
    #[must_use]
    pub fn is_open_now(&self) -> bool {
        self.is_open(&Local::now())
    }

    /// Whether the window is open at the given weekday and wall-clock time.
    ///
    /// The window wraps around its repetition period, so a Sunday-night
    /// window can extend into Monday morning.
    #[must_use]
    pub fn is_open_at(&self, weekday: Weekday, time: NaiveTime) -> bool {
        let period = self.period_seconds();

        let start_offset = match self.start_day {
            Some(day) => {
                u64::from(day.num_days_from_sunday()) * SECONDS_PER_DAY
                    + seconds_of_day(self.start_time)
            }
            None => seconds_of_day(self.start_time),
        };

        let now_offset = if self.start_day.is_some() {
            u64::from(weekday.num_days_from_sunday()) * SECONDS_PER_DAY + seconds_of_day(time)
        } else {
            seconds_of_day(time)
        };

        let elapsed = (now_offset + period - start_offset) % period;

        elapsed < self.length.as_secs()
    }

    fn period_seconds(&self) -> u64 {
        if self.start_day.is_some() {
            SECONDS_PER_WEEK
        } else {
            SECONDS_PER_DAY
        }
    }
}

fn seconds_of_day(time: NaiveTime) -> u64 {
    u64::from(time.num_seconds_from_midnight())
}

#[cfg(test)]
#[path = "reboot_window_tests.rs"]
mod reboot_window_tests;
