//! Daily run planning
//!
//! Anchors are the configured `HH:MM` times at which remediation runs. Each
//! anchor gets check-only probes `spacing` minutes before and after it, plus
//! a third probe at `2 * spacing` after when that slot is free. No two run
//! times end up closer than `spacing` minutes on the 24h clock.

use crate::config::ScheduleConfig;
use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike};
use serde::Serialize;
use tracing::{debug, warn};

const MINUTES_PER_DAY: u32 = 24 * 60;
/// No two times on a 24h clock can be further apart than this.
const MAX_SPACING: u32 = MINUTES_PER_DAY / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Check,
    Remediate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid time '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("no anchor times configured")]
    NoAnchors,
    #[error("spacing must be at least one minute")]
    ZeroSpacing,
    #[error("spacing of {0} minutes exceeds half a day")]
    SpacingTooLarge(u32),
    #[error("anchors {first} and {second} are {gap} minutes apart, minimum is {spacing}")]
    TooClose {
        first: String,
        second: String,
        gap: u32,
        spacing: u32,
    },
}

/// An anchor with the probes derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSlot {
    pub anchor: NaiveTime,
    pub probes: Vec<NaiveTime>,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    slots: Vec<ScheduleSlot>,
    entries: Vec<(NaiveTime, RunKind)>,
    spacing: u32,
    remediation: bool,
}

impl Schedule {
    /// Validates the anchors and derives all run times.
    pub fn build(
        anchors: &[String],
        spacing_minutes: u32,
        remediation: bool,
    ) -> Result<Self, ScheduleError> {
        if spacing_minutes == 0 {
            return Err(ScheduleError::ZeroSpacing);
        }
        if spacing_minutes > MAX_SPACING {
            return Err(ScheduleError::SpacingTooLarge(spacing_minutes));
        }
        if anchors.is_empty() {
            return Err(ScheduleError::NoAnchors);
        }

        let mut minutes = anchors
            .iter()
            .map(|a| parse_minutes(a))
            .collect::<Result<Vec<u32>, _>>()?;
        minutes.sort_unstable();

        for (i, &first) in minutes.iter().enumerate() {
            for &second in &minutes[i + 1..] {
                let gap = circular_gap(first, second);
                if gap < spacing_minutes {
                    return Err(ScheduleError::TooClose {
                        first: format_minutes(first),
                        second: format_minutes(second),
                        gap,
                        spacing: spacing_minutes,
                    });
                }
            }
        }

        Ok(Self::derive(&minutes, spacing_minutes, remediation))
    }

    /// Builds from configuration, falling back to a single 03:00 anchor with
    /// 40 minute spacing when the configured anchors are invalid.
    pub fn from_config(config: &ScheduleConfig) -> Self {
        match Self::build(&config.anchors, config.spacing_minutes, config.remediation) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(error = %e, "Invalid schedule, using default 03:00 with 40 minute spacing");
                Self::derive(&[3 * 60], 40, config.remediation)
            }
        }
    }

    fn derive(anchors: &[u32], spacing: u32, remediation: bool) -> Self {
        let mut taken: Vec<u32> = anchors.to_vec();
        let mut probes: Vec<Vec<u32>> = vec![Vec::new(); anchors.len()];

        let near = |anchor: u32| {
            [
                (anchor + MINUTES_PER_DAY - spacing % MINUTES_PER_DAY) % MINUTES_PER_DAY,
                (anchor + spacing) % MINUTES_PER_DAY,
            ]
        };
        let far = |anchor: u32| (anchor + 2 * spacing) % MINUTES_PER_DAY;

        // Before/after probes take precedence over the farther third probe.
        for (i, &anchor) in anchors.iter().enumerate() {
            for candidate in near(anchor) {
                place(&mut taken, &mut probes[i], candidate, spacing);
            }
        }
        for (i, &anchor) in anchors.iter().enumerate() {
            place(&mut taken, &mut probes[i], far(anchor), spacing);
        }

        let slots: Vec<ScheduleSlot> = anchors
            .iter()
            .zip(&probes)
            .map(|(&anchor, probes)| ScheduleSlot {
                anchor: to_time(anchor),
                probes: probes.iter().map(|&p| to_time(p)).collect(),
            })
            .collect();

        let anchor_kind = if remediation {
            RunKind::Remediate
        } else {
            RunKind::Check
        };
        let mut entries: Vec<(NaiveTime, RunKind)> = anchors
            .iter()
            .map(|&a| (to_time(a), anchor_kind))
            .chain(probes.iter().flatten().map(|&p| (to_time(p), RunKind::Check)))
            .collect();
        entries.sort_by_key(|(time, _)| *time);

        debug!(runs = entries.len(), spacing, remediation, "Schedule derived");

        Self {
            slots,
            entries,
            spacing,
            remediation,
        }
    }

    pub fn slots(&self) -> &[ScheduleSlot] {
        &self.slots
    }

    /// Every daily run, sorted by time of day.
    pub fn entries(&self) -> &[(NaiveTime, RunKind)] {
        &self.entries
    }

    pub fn spacing_minutes(&self) -> u32 {
        self.spacing
    }

    pub fn remediation_enabled(&self) -> bool {
        self.remediation
    }

    /// The soonest run strictly after `now`, wrapping to tomorrow's first run.
    pub fn next_after(&self, now: NaiveDateTime) -> (NaiveDateTime, RunKind) {
        let today = now.date();
        if let Some(&(time, kind)) = self.entries.iter().find(|(t, _)| *t > now.time()) {
            return (today.and_time(time), kind);
        }
        // Entries are never empty: build() rejects empty anchor lists.
        let (time, kind) = self.entries[0];
        ((today + Duration::days(1)).and_time(time), kind)
    }

    /// `HH:MM` list for messages, remediation runs marked.
    pub fn describe(&self) -> String {
        self.entries
            .iter()
            .map(|(time, kind)| match kind {
                RunKind::Remediate => format!("{} (update)", time.format("%H:%M")),
                RunKind::Check => time.format("%H:%M").to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Adds `candidate` unless it coincides with or crowds an existing run.
fn place(taken: &mut Vec<u32>, probes: &mut Vec<u32>, candidate: u32, spacing: u32) {
    if taken.iter().any(|&t| circular_gap(t, candidate) < spacing) {
        debug!(probe = %format_minutes(candidate), "Probe skipped, slot already covered");
        return;
    }
    taken.push(candidate);
    probes.push(candidate);
}

fn parse_minutes(raw: &str) -> Result<u32, ScheduleError> {
    let time = NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| ScheduleError::InvalidTime(raw.to_string()))?;
    Ok(time.hour() * 60 + time.minute())
}

fn circular_gap(a: u32, b: u32) -> u32 {
    let diff = a.abs_diff(b) % MINUTES_PER_DAY;
    diff.min(MINUTES_PER_DAY - diff)
}

fn to_time(minutes: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(minutes / 60, minutes % 60, 0).unwrap_or_default()
}

fn format_minutes(minutes: u32) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}
