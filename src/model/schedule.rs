use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which firing family a schedule belongs to
///
/// Exactly one arm of [`ScheduleDefinition`] is meaningful for a given type;
/// the store does not validate this, the scheduler does when it materializes
/// the firing plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Cron expression, evaluated in UTC
    Cron,
    /// Fixed list of absolute instants
    AtTimes,
    /// Recurring fixed interval
    Duration,
}

/// A persisted schedule document
///
/// `id` is minted by the store on create and is stable for the document's
/// lifetime. `name` is a human label with no uniqueness requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Globally unique identifier, assigned by the store
    #[serde(default)]
    pub id: String,

    /// Human label, not unique
    #[serde(default)]
    pub name: String,

    /// Firing family selector
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,

    /// The family-specific firing definition
    #[serde(default)]
    pub definition: ScheduleDefinition,
}

/// Family-specific firing parameters
///
/// Unused arms may be omitted on the wire or carry zero values; only the arm
/// selected by [`Schedule::schedule_type`] is consulted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    /// Cron expression; seconds-bearing form if parseable as such,
    /// otherwise standard 5-field form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,

    /// Absolute UTC instants to fire at, once each
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub times: Option<Vec<DateTime<Utc>>>,

    /// Fixed interval between fires, serialized as a duration string
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub interval: Option<Duration>,
}
