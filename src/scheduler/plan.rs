//! Next-fire-time computation for the three schedule families
//!
//! A [`FiringPlan`] is the materialized form of a schedule definition: it
//! owns the entry's next due instant and knows how to advance it after a
//! fire (or a skipped fire: missed instants are dropped, never caught up).
//!
//! Cron expressions are evaluated in UTC. The seconds-bearing dialect of the
//! `cron` crate is authoritative: an expression is first parsed as 6/7-field
//! (with seconds); when that fails a `0` seconds field is prepended, which
//! gives standard 5-field expressions minute resolution.

use crate::model::{Schedule, ScheduleType};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::str::FromStr;
use thiserror::Error;

/// The schedule definition cannot be materialized into a firing plan
#[derive(Debug, Error)]
#[error("unsupported schedule definition: {reason}")]
pub struct UnsupportedDefinition {
    pub reason: String,
}

impl UnsupportedDefinition {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
enum PlanKind {
    Cron { expression: Box<cron::Schedule> },
    AtTimes { times: Vec<DateTime<Utc>> },
    Every { interval: ChronoDuration },
}

/// Materialized firing plan for one installed schedule
#[derive(Debug, Clone)]
pub struct FiringPlan {
    kind: PlanKind,
    next_at: Option<DateTime<Utc>>,
}

impl FiringPlan {
    /// Materialize a schedule's definition, anchored at `now`
    ///
    /// Rejects definitions whose selected arm is missing or unparseable;
    /// the caller must leave any existing entry untouched in that case.
    pub fn new(schedule: &Schedule, now: DateTime<Utc>) -> Result<Self, UnsupportedDefinition> {
        match schedule.schedule_type {
            ScheduleType::Cron => {
                let raw = schedule
                    .definition
                    .cron_expression
                    .as_deref()
                    .filter(|e| !e.trim().is_empty())
                    .ok_or_else(|| UnsupportedDefinition::new("missing cron expression"))?;
                let expression = parse_cron(raw)?;
                let next_at = expression.after(&now).next();
                Ok(Self {
                    kind: PlanKind::Cron {
                        expression: Box::new(expression),
                    },
                    next_at,
                })
            }
            ScheduleType::AtTimes => {
                let mut times = schedule.definition.times.clone().unwrap_or_default();
                times.sort_unstable();
                times.dedup();
                // Instants already in the past never fire; an empty or fully
                // past list installs as quiescent
                let next_at = times.iter().copied().find(|t| *t >= now);
                Ok(Self {
                    kind: PlanKind::AtTimes { times },
                    next_at,
                })
            }
            ScheduleType::Duration => {
                let interval = schedule
                    .definition
                    .interval
                    .filter(|i| !i.is_zero())
                    .ok_or_else(|| UnsupportedDefinition::new("missing or zero interval"))?;
                let interval = ChronoDuration::from_std(interval)
                    .map_err(|_| UnsupportedDefinition::new("interval out of range"))?;
                Ok(Self {
                    kind: PlanKind::Every { interval },
                    next_at: Some(now + interval),
                })
            }
        }
    }

    /// The next due instant; `None` means the entry is quiescent
    pub fn next_at(&self) -> Option<DateTime<Utc>> {
        self.next_at
    }

    /// Whether the plan will never fire again
    pub fn is_quiescent(&self) -> bool {
        self.next_at.is_none()
    }

    /// Advance past the current due instant, as if it had fired
    ///
    /// For the interval family the successor is exactly one interval after
    /// the previous *scheduled* time, so drift never accumulates; instants
    /// that would land at or before `now` are dropped rather than caught up.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        let Some(current) = self.next_at else {
            return;
        };
        self.next_at = match &self.kind {
            PlanKind::Cron { expression } => {
                let anchor = if now > current { now } else { current };
                expression.after(&anchor).next()
            }
            PlanKind::AtTimes { times } => times.iter().copied().find(|t| *t > current),
            PlanKind::Every { interval } => {
                let mut next = current + *interval;
                while next <= now {
                    next = next + *interval;
                }
                Some(next)
            }
        };
    }
}

/// Parse a cron expression, seconds-bearing dialect first
fn parse_cron(raw: &str) -> Result<cron::Schedule, UnsupportedDefinition> {
    if let Ok(expression) = cron::Schedule::from_str(raw) {
        return Ok(expression);
    }
    cron::Schedule::from_str(&format!("0 {raw}")).map_err(|e| {
        UnsupportedDefinition::new(format!("unparseable cron expression {raw:?}: {e}"))
    })
}
