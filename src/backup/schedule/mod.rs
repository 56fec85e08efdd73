//! Schedule definitions and the recurrence scheduler.
//!
//! A [`ScheduleDefinition`] is an immutable value object. The [`Scheduler`]
//! owns the registry of definitions, validates them on `add`/`update`,
//! computes each one's next trigger instant and fires a callback when it is
//! due.

pub mod recurrence;
pub mod scheduler;

pub use recurrence::Recurrence;
pub use scheduler::{ScheduleEntry, Scheduler, SchedulerHandle, TriggerCallback};

use bon::Builder;
use chrono::NaiveTime;
use derive_more::Display;
use getset::{CopyGetters, Getters};
use globset::GlobBuilder;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::skip_serializing_none;
use std::fmt::Formatter;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;
use validator::{Validate, ValidationError};

static TIME_OF_DAY_FORMAT: &str = "%H:%M";

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    #[display("hourly")]
    Hourly,
    #[display("daily")]
    Daily,
    #[display("weekly")]
    Weekly,
    #[display("monthly")]
    Monthly,
}

/// What a scheduled run backs up
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    #[default]
    #[display("full")]
    Full,
    #[display("incremental")]
    Incremental,
}

/// Wall-clock time in `HH:MM` form
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{}", _0.format(TIME_OF_DAY_FORMAT))]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    pub fn as_naive(&self) -> NaiveTime {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveTime::parse_from_str(s.trim(), TIME_OF_DAY_FORMAT).map(Self)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct TimeOfDayVisitor;

impl Visitor<'_> for TimeOfDayVisitor {
    type Value = TimeOfDay;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a time of day in HH:MM format")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        TimeOfDay::from_str(v)
            .map_err(|e| E::custom(format!("invalid time of day {v:?}: {e}")))
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(TimeOfDayVisitor)
    }
}

fn new_schedule_id() -> String {
    Uuid::new_v4().to_string()
}

/// A recurring backup job.
///
/// `day_of_week` (0 = Sunday) is only accepted for weekly schedules and
/// `day_of_month` only for monthly ones. Every frequency except hourly needs a
/// `time`.
#[skip_serializing_none]
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate, Builder, Getters, CopyGetters,
)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_frequency_fields))]
pub struct ScheduleDefinition {
    #[serde(default = "new_schedule_id")]
    #[builder(default = new_schedule_id(), into)]
    #[validate(length(min = 1))]
    #[getset(get = "pub")]
    id: String,
    #[builder(into)]
    #[validate(length(min = 1, max = 100))]
    #[getset(get = "pub")]
    name: String,
    #[serde(default = "default_enabled")]
    #[builder(default = true)]
    #[getset(get_copy = "pub")]
    enabled: bool,
    #[getset(get_copy = "pub")]
    frequency: Frequency,
    #[getset(get_copy = "pub")]
    time: Option<TimeOfDay>,
    #[validate(range(min = 0, max = 6))]
    #[getset(get_copy = "pub")]
    day_of_week: Option<u8>,
    #[validate(range(min = 1, max = 31))]
    #[getset(get_copy = "pub")]
    day_of_month: Option<u8>,
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    backup_kind: BackupKind,
    #[serde(default)]
    #[builder(default, into)]
    #[getset(get = "pub")]
    include_paths: Arc<[String]>,
    #[serde(default)]
    #[builder(default, into)]
    #[getset(get = "pub")]
    exclude_paths: Arc<[String]>,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleDefinition {
    /// The recurrence rule this definition describes, if its fields agree
    /// with its frequency.
    pub fn recurrence(&self) -> Result<Recurrence, ValidationError> {
        validate_frequency_fields(self)?;
        let time = self.time.map(|t| t.as_naive());
        Ok(match (self.frequency, time) {
            (Frequency::Hourly, _) => Recurrence::Hourly,
            (Frequency::Daily, Some(time)) => Recurrence::Daily { time },
            (Frequency::Weekly, Some(time)) => Recurrence::Weekly {
                day_of_week: self.day_of_week.unwrap_or_default(),
                time,
            },
            (Frequency::Monthly, Some(time)) => Recurrence::Monthly {
                day_of_month: self.day_of_month.unwrap_or(1),
                time,
            },
            (_, None) => return Err(field_error("MissingTime", "time is required")),
        })
    }

    pub fn with_enabled(&self, enabled: bool) -> Self {
        Self {
            enabled,
            ..self.clone()
        }
    }
}

fn field_error(code: &'static str, msg: impl Into<String>) -> ValidationError {
    let msg: String = msg.into();
    ValidationError::new(code).with_message(msg.into())
}

/// Checks the field combinations that depend on the frequency.
fn validate_frequency_fields(def: &ScheduleDefinition) -> Result<(), ValidationError> {
    let frequency = def.frequency;
    match (frequency, def.time) {
        (Frequency::Hourly, Some(_)) => {
            return Err(field_error(
                "TimeNotApplicable",
                "time must not be set for hourly schedules",
            ))
        }
        (Frequency::Hourly, None) => {}
        (_, None) => {
            return Err(field_error(
                "MissingTime",
                format!("time is required for {frequency} schedules"),
            ))
        }
        (_, Some(_)) => {}
    }

    match (frequency, def.day_of_week) {
        (Frequency::Weekly, None) => {
            return Err(field_error(
                "MissingDayOfWeek",
                "day_of_week is required for weekly schedules",
            ))
        }
        (Frequency::Weekly, Some(_)) | (_, None) => {}
        (_, Some(_)) => {
            return Err(field_error(
                "DayOfWeekNotApplicable",
                format!("day_of_week must not be set for {frequency} schedules"),
            ))
        }
    }

    match (frequency, def.day_of_month) {
        (Frequency::Monthly, None) => {
            return Err(field_error(
                "MissingDayOfMonth",
                "day_of_month is required for monthly schedules",
            ))
        }
        (Frequency::Monthly, Some(_)) | (_, None) => {}
        (_, Some(_)) => {
            return Err(field_error(
                "DayOfMonthNotApplicable",
                format!("day_of_month must not be set for {frequency} schedules"),
            ))
        }
    }

    if def.include_paths.is_empty() {
        return Err(field_error(
            "MissingIncludePaths",
            "at least one include path is required",
        ));
    }

    if let Some(bad) = def
        .exclude_paths
        .iter()
        .find(|p| GlobBuilder::new(p).literal_separator(true).build().is_err())
    {
        return Err(field_error(
            "InvalidExcludePattern",
            format!("exclude pattern {bad:?} is not a valid glob"),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daily() -> ScheduleDefinition {
        ScheduleDefinition::builder()
            .id("nightly")
            .name("Nightly documents")
            .frequency(Frequency::Daily)
            .time("02:00".parse().unwrap())
            .include_paths(vec!["/home/user/docs".to_string()])
            .build()
    }

    fn codes(def: &ScheduleDefinition) -> Vec<String> {
        let errors = def.validate().unwrap_err();
        errors
            .errors()
            .values()
            .flat_map(|kind| match kind {
                validator::ValidationErrorsKind::Field(errs) => {
                    errs.iter().map(|e| e.code.to_string()).collect::<Vec<_>>()
                }
                _ => vec![],
            })
            .collect()
    }

    #[test]
    fn test_valid_daily_schedule() {
        let def = daily();
        assert!(def.validate().is_ok());
        assert!(def.enabled());
        assert_eq!(def.backup_kind(), BackupKind::Full);
    }

    #[test]
    fn test_day_of_week_rejected_outside_weekly() {
        let def = ScheduleDefinition {
            day_of_week: Some(3),
            ..daily()
        };
        assert_eq!(codes(&def), vec!["DayOfWeekNotApplicable".to_string()]);
    }

    #[test]
    fn test_day_of_month_rejected_outside_monthly() {
        let def = ScheduleDefinition {
            frequency: Frequency::Weekly,
            day_of_week: Some(1),
            day_of_month: Some(12),
            ..daily()
        };
        assert_eq!(codes(&def), vec!["DayOfMonthNotApplicable".to_string()]);
    }

    #[test]
    fn test_missing_time_rejected() {
        let def = ScheduleDefinition {
            time: None,
            ..daily()
        };
        assert_eq!(codes(&def), vec!["MissingTime".to_string()]);
    }

    #[test]
    fn test_hourly_rejects_time() {
        let def = ScheduleDefinition {
            frequency: Frequency::Hourly,
            ..daily()
        };
        assert_eq!(codes(&def), vec!["TimeNotApplicable".to_string()]);
    }

    #[test]
    fn test_weekly_requires_day_of_week() {
        let def = ScheduleDefinition {
            frequency: Frequency::Weekly,
            ..daily()
        };
        assert_eq!(codes(&def), vec!["MissingDayOfWeek".to_string()]);
    }

    #[test]
    fn test_out_of_range_days_rejected() {
        let def = ScheduleDefinition {
            frequency: Frequency::Monthly,
            day_of_month: Some(32),
            ..daily()
        };
        assert!(def.validate().is_err());

        let def = ScheduleDefinition {
            frequency: Frequency::Weekly,
            day_of_week: Some(7),
            ..daily()
        };
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_invalid_exclude_glob_rejected() {
        let def = ScheduleDefinition {
            exclude_paths: vec!["[oops".to_string()].into(),
            ..daily()
        };
        assert_eq!(codes(&def), vec!["InvalidExcludePattern".to_string()]);
    }

    #[test]
    fn test_time_of_day_parse_and_display() {
        let t: TimeOfDay = "7:05".parse().unwrap();
        assert_eq!(t.to_string(), "07:05");
        assert!("24:00".parse::<TimeOfDay>().is_err());
        assert!("noon".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn test_definition_yaml_roundtrip_keeps_fields() {
        let yaml = r#"
id: weekly-photos
name: Photos
frequency: weekly
time: "23:30"
day_of_week: 0
backup_kind: incremental
include_paths: ["/photos"]
exclude_paths: ["**/*.tmp"]
"#;
        let def: ScheduleDefinition = serde_yml::from_str(yaml).unwrap();
        assert!(def.validate().is_ok());
        assert_eq!(def.frequency(), Frequency::Weekly);
        assert_eq!(def.time().unwrap().to_string(), "23:30");
        assert_eq!(def.backup_kind(), BackupKind::Incremental);
        assert_eq!(def.exclude_paths().len(), 1);

        let json = serde_json::to_string(&def).unwrap();
        assert!(!json.contains("day_of_month"));
        let back: ScheduleDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, def);
    }

    #[test]
    fn test_recurrence_from_definition() {
        let def = ScheduleDefinition {
            frequency: Frequency::Monthly,
            day_of_month: Some(31),
            ..daily()
        };
        assert_eq!(
            def.recurrence().unwrap(),
            Recurrence::Monthly {
                day_of_month: 31,
                time: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            }
        );
    }
}
