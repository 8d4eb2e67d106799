//! Timing executors: DELAY, SCHEDULE, EVENT_WAIT
//!
//! Short delays sleep cooperatively inside the worker. Anything longer than
//! [`INLINE_SLEEP_CAP_SECONDS`] becomes a durable waiting result with a
//! `resume_at` timestamp so the execution can be checkpointed and woken by an
//! external scheduler.

use crate::context::ProcessContext;
use crate::definition::ProcessNode;
use crate::deps::Dependencies;
use crate::error::ExecutionError;
use crate::executor::{config_str, config_string_or, config_u64, NodeExecutor};
use crate::result::{NodeResult, WaitingKind};
use crate::state::ProcessState;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Longest delay served by an inline sleep; beyond this the node waits
pub const INLINE_SLEEP_CAP_SECONDS: f64 = 300.0;

// ----- DELAY --------------------------------------------------------------

/// Pause for a duration or until a time
///
/// Config: `delay_type` (seconds|minutes|hours|until_time|until_datetime),
/// `duration`, `until`, `max_wait_seconds`.
pub struct DelayExecutor;

impl DelayExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }
}

fn numeric_duration(
    raw: Option<&Value>,
    state: &ProcessState,
) -> Result<f64, ExecutionError> {
    match raw {
        Some(Value::String(expr)) => state
            .evaluate(expr)
            .ok()
            .and_then(|v| v.as_f64())
            .ok_or_else(|| {
                ExecutionError::validation_error(format!("Invalid duration expression: {expr}"))
            }),
        Some(value) => value
            .as_f64()
            .ok_or_else(|| ExecutionError::validation_error("duration must be numeric")),
        None => Ok(0.0),
    }
}

#[async_trait]
impl NodeExecutor for DelayExecutor {
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let delay_type = config_string_or(node, "delay_type", "seconds");
        let max_wait = config_u64(node, "max_wait_seconds", 86_400) as f64;

        let mut logs = vec![format!("Delay type: {delay_type}")];

        let wait_seconds = match delay_type.as_str() {
            "seconds" | "minutes" | "hours" => {
                let duration = match numeric_duration(node.config_value("duration"), state) {
                    Ok(duration) => duration,
                    Err(error) => {
                        return NodeResult::failure(error.with_source_node(&node.id))
                            .with_logs(logs);
                    }
                };
                let factor = match delay_type.as_str() {
                    "minutes" => 60.0,
                    "hours" => 3600.0,
                    _ => 1.0,
                };
                let wait = duration * factor;
                logs.push(format!("Waiting {wait} seconds"));
                wait
            }
            "until_time" => {
                let raw = config_string_or(node, "until", "");
                let until = state.interpolate_string(&raw).unwrap_or(raw);
                let mut parts = until.split(':');
                let parse = |part: Option<&str>| part.and_then(|p| p.parse::<u32>().ok());
                let (hour, minute, second) = (
                    parse(parts.next()),
                    parse(parts.next()).or(Some(0)),
                    parse(parts.next()).or(Some(0)),
                );
                let (Some(hour), Some(minute), Some(second)) = (hour, minute, second) else {
                    return NodeResult::failure(
                        ExecutionError::validation_error(format!(
                            "Invalid time format: {until}"
                        ))
                        .with_source_node(&node.id),
                    )
                    .with_logs(logs);
                };
                let now = Utc::now();
                let mut target = now
                    .date_naive()
                    .and_hms_opt(hour, minute, second)
                    .map(|naive| Utc.from_utc_datetime(&naive))
                    .unwrap_or(now);
                if target <= now {
                    target += Duration::days(1);
                }
                logs.push(format!("Waiting until {}", target.to_rfc3339()));
                (target - now).num_milliseconds() as f64 / 1000.0
            }
            "until_datetime" => {
                let raw = config_string_or(node, "until", "");
                let until = state.interpolate_string(&raw).unwrap_or(raw);
                let target = match DateTime::parse_from_rfc3339(&until.replace(' ', "T")) {
                    Ok(target) => target.with_timezone(&Utc),
                    Err(e) => {
                        return NodeResult::failure(
                            ExecutionError::validation_error(format!(
                                "Invalid datetime format: {e}"
                            ))
                            .with_source_node(&node.id),
                        )
                        .with_logs(logs);
                    }
                };
                let wait = (target - Utc::now()).num_milliseconds() as f64 / 1000.0;
                if wait < 0.0 {
                    logs.push("Target datetime is in the past - continuing immediately".to_string());
                    0.0
                } else {
                    logs.push(format!("Waiting until {}", target.to_rfc3339()));
                    wait
                }
            }
            other => {
                return NodeResult::failure(
                    ExecutionError::validation_error(format!("Unknown delay type: {other}"))
                        .with_source_node(&node.id),
                )
                .with_logs(logs);
            }
        };

        let wait_seconds = if wait_seconds > max_wait {
            logs.push(format!(
                "Wait time {wait_seconds}s exceeds max {max_wait}s - capping"
            ));
            max_wait
        } else {
            wait_seconds
        };

        // Long waits release the worker and rely on the external scheduler
        if wait_seconds > INLINE_SLEEP_CAP_SECONDS {
            let resume_at = Utc::now() + Duration::milliseconds((wait_seconds * 1000.0) as i64);
            logs.push(format!(
                "Long delay - pausing for resume at {}",
                resume_at.to_rfc3339()
            ));
            return NodeResult::waiting(
                WaitingKind::Delay,
                json!({
                    "resume_at": resume_at.to_rfc3339(),
                    "wait_seconds": wait_seconds,
                    "delay_type": delay_type,
                }),
            )
            .with_logs(logs);
        }

        if wait_seconds > 0.0 {
            logs.push(format!("Sleeping for {wait_seconds:.1} seconds"));
            tokio::time::sleep(std::time::Duration::from_secs_f64(wait_seconds)).await;
            logs.push("Delay complete".to_string());
        }

        NodeResult::success(json!({
            "delayed_seconds": wait_seconds,
            "completed_at": Utc::now().to_rfc3339(),
        }))
        .with_logs(logs)
    }
}

// ----- SCHEDULE -----------------------------------------------------------

/// Business-hours configuration for SCHEDULE
struct BusinessHours {
    start_hour: u32,
    end_hour: u32,
    weekdays_only: bool,
    timezone: Tz,
    holidays: HashSet<NaiveDate>,
    custom_days: serde_json::Map<String, Value>,
}

impl BusinessHours {
    fn from_config(config: &serde_json::Map<String, Value>) -> Self {
        let timezone = config
            .get("timezone")
            .and_then(Value::as_str)
            .and_then(|tz| tz.parse::<Tz>().ok())
            .unwrap_or(chrono_tz::UTC);
        let holidays = config
            .get("holidays")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            start_hour: config.get("start_hour").and_then(Value::as_u64).unwrap_or(9) as u32,
            end_hour: config.get("end_hour").and_then(Value::as_u64).unwrap_or(17) as u32,
            weekdays_only: config
                .get("weekdays_only")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            timezone,
            holidays,
            custom_days: config
                .get("custom_days")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Window for a given local date, honoring per-day overrides
    fn hours_for(&self, date: NaiveDate) -> (u32, u32) {
        let day_name = match date.weekday() {
            chrono::Weekday::Mon => "monday",
            chrono::Weekday::Tue => "tuesday",
            chrono::Weekday::Wed => "wednesday",
            chrono::Weekday::Thu => "thursday",
            chrono::Weekday::Fri => "friday",
            chrono::Weekday::Sat => "saturday",
            chrono::Weekday::Sun => "sunday",
        };
        match self.custom_days.get(day_name).and_then(Value::as_object) {
            Some(overrides) => (
                overrides
                    .get("start")
                    .and_then(Value::as_u64)
                    .map(|h| h as u32)
                    .unwrap_or(self.start_hour),
                overrides
                    .get("end")
                    .and_then(Value::as_u64)
                    .map(|h| h as u32)
                    .unwrap_or(self.end_hour),
            ),
            None => (self.start_hour, self.end_hour),
        }
    }

    fn is_working_day(&self, date: NaiveDate) -> bool {
        if self.weekdays_only && date.weekday().num_days_from_monday() >= 5 {
            return false;
        }
        !self.holidays.contains(&date)
    }

    /// Whether a local time falls inside the window
    fn is_open(&self, local: DateTime<Tz>) -> bool {
        let (start, end) = self.hours_for(local.date_naive());
        self.is_working_day(local.date_naive()) && local.hour() >= start && local.hour() < end
    }

    /// Next window start strictly after `local`, as UTC
    fn next_open(&self, local: DateTime<Tz>) -> Option<DateTime<Utc>> {
        let mut date = local.date_naive();
        let (start, _) = self.hours_for(date);
        // Today's window already started (or passed), or today is closed:
        // move to the next day
        if local.hour() >= start || !self.is_working_day(date) {
            date = date.succ_opt()?;
        }
        for _ in 0..30 {
            if self.is_working_day(date) {
                let (start, _) = self.hours_for(date);
                let naive = date.and_hms_opt(start, 0, 0)?;
                let target = self.timezone.from_local_datetime(&naive).earliest()?;
                return Some(target.with_timezone(&Utc));
            }
            date = date.succ_opt()?;
        }
        None
    }
}

/// Wait until a datetime or the next business-hours window
///
/// Config: `schedule_type` (datetime|business_hours), `datetime`,
/// `timezone`, `business_hours` {start_hour, end_hour, weekdays_only,
/// timezone, holidays, custom_days}.
pub struct ScheduleExecutor;

impl ScheduleExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NodeExecutor for ScheduleExecutor {
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let schedule_type = config_string_or(node, "schedule_type", "datetime");
        let timezone = config_string_or(node, "timezone", "UTC");

        let mut logs = vec![format!("Schedule type: {schedule_type}")];

        match schedule_type.as_str() {
            "datetime" => {
                let Some(raw) = config_str(node, "datetime") else {
                    return NodeResult::failure(
                        ExecutionError::validation_error("datetime is required")
                            .with_source_node(&node.id),
                    )
                    .with_logs(logs);
                };
                let target_str = state
                    .interpolate_string(raw)
                    .unwrap_or_else(|_| raw.to_string());
                let target = match DateTime::parse_from_rfc3339(&target_str.replace(' ', "T")) {
                    Ok(target) => target.with_timezone(&Utc),
                    Err(e) => {
                        return NodeResult::failure(
                            ExecutionError::validation_error(format!("Invalid datetime: {e}"))
                                .with_source_node(&node.id),
                        )
                        .with_logs(logs);
                    }
                };

                let now = Utc::now();
                if target <= now {
                    logs.push("Scheduled time has passed - continuing".to_string());
                    return NodeResult::success(
                        json!({ "waited": false, "reason": "past_schedule" }),
                    )
                    .with_logs(logs);
                }

                logs.push(format!("Scheduled for {}", target.to_rfc3339()));
                NodeResult::waiting(
                    WaitingKind::Schedule,
                    json!({
                        "resume_at": target.to_rfc3339(),
                        "wait_seconds": (target - now).num_seconds(),
                        "timezone": timezone,
                    }),
                )
                .with_logs(logs)
            }
            "business_hours" => {
                let config = crate::executor::config_map(node, "business_hours");
                let hours = BusinessHours::from_config(&config);
                let local_now = Utc::now().with_timezone(&hours.timezone);
                logs.push(format!(
                    "Local time ({}): {}",
                    hours.timezone,
                    local_now.format("%Y-%m-%d %H:%M")
                ));

                if hours.is_open(local_now) {
                    logs.push("Currently in business hours - continuing".to_string());
                    return NodeResult::success(
                        json!({ "waited": false, "reason": "in_business_hours" }),
                    )
                    .with_logs(logs);
                }

                let Some(target) = hours.next_open(local_now) else {
                    return NodeResult::failure(
                        ExecutionError::validation_error(
                            "No business-hours window found within 30 days",
                        )
                        .with_source_node(&node.id),
                    )
                    .with_logs(logs);
                };
                let wait_seconds = (target - Utc::now()).num_seconds();
                logs.push(format!("Next business hours: {}", target.to_rfc3339()));

                NodeResult::waiting(
                    WaitingKind::Schedule,
                    json!({
                        "resume_at": target.to_rfc3339(),
                        "wait_seconds": wait_seconds,
                        "reason": "business_hours",
                        "timezone": hours.timezone.to_string(),
                    }),
                )
                .with_logs(logs)
            }
            other => NodeResult::failure(
                ExecutionError::validation_error(format!("Unknown schedule type: {other}"))
                    .with_source_node(&node.id),
            )
            .with_logs(logs),
        }
    }
}

// ----- EVENT_WAIT ---------------------------------------------------------

/// Wait for an external event
///
/// Returns waiting(event); an external dispatcher resumes the execution with
/// the event payload, or forces the configured timeout action at the
/// deadline.
pub struct EventWaitExecutor;

impl EventWaitExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NodeExecutor for EventWaitExecutor {
    async fn execute(
        &self,
        node: &ProcessNode,
        _state: &mut ProcessState,
        context: &ProcessContext,
    ) -> NodeResult {
        let event_type = config_string_or(node, "event_type", "webhook");
        let event_filter = config_str(node, "event_filter").map(str::to_string);
        let timeout_seconds = config_u64(node, "timeout_seconds", 3600);
        let timeout_action = config_string_or(node, "timeout_action", "fail");
        let default_value = node.config_value("default_value").cloned();

        let mut logs = vec![format!("Waiting for event: {event_type}")];
        if let Some(filter) = &event_filter {
            logs.push(format!("Filter: {filter}"));
        }

        let timeout_at = Utc::now() + Duration::seconds(timeout_seconds as i64);
        logs.push(format!("Timeout at: {}", timeout_at.to_rfc3339()));

        NodeResult::waiting(
            WaitingKind::Event,
            json!({
                "event_type": event_type,
                "event_filter": event_filter,
                "timeout_at": timeout_at.to_rfc3339(),
                "timeout_action": timeout_action,
                "default_value": default_value,
                "execution_id": context.execution_id,
                "node_id": node.id,
            }),
        )
        .with_logs(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{NodeConfig, NodeType};

    fn make_node(node_type: NodeType, type_config: Value) -> ProcessNode {
        ProcessNode {
            id: "t1".to_string(),
            node_type,
            name: "timing".to_string(),
            config: NodeConfig {
                type_config: type_config.as_object().cloned().unwrap_or_default(),
                ..NodeConfig::default()
            },
            input_mapping: None,
            output_variable: None,
            next: None,
        }
    }

    fn deps() -> Arc<Dependencies> {
        Arc::new(Dependencies::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_delay_sleeps_inline() {
        let node = make_node(
            NodeType::Delay,
            json!({"delay_type": "seconds", "duration": 2}),
        );
        let mut state = ProcessState::default();

        let result = DelayExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert!(result.is_success());
        assert_eq!(result.output.unwrap()["delayed_seconds"], json!(2.0));
    }

    #[tokio::test]
    async fn test_long_delay_returns_waiting() {
        let node = make_node(
            NodeType::Delay,
            json!({"delay_type": "hours", "duration": 2}),
        );
        let mut state = ProcessState::default();

        let result = DelayExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert!(result.is_waiting());
        assert_eq!(result.waiting_for, Some(WaitingKind::Delay));
        let metadata = result.waiting_metadata.unwrap();
        assert!(metadata["resume_at"].is_string());
        assert_eq!(metadata["wait_seconds"], json!(7200.0));
    }

    #[tokio::test]
    async fn test_delay_duration_from_expression() {
        let node = make_node(
            NodeType::Delay,
            json!({"delay_type": "minutes", "duration": "{{wait}}"}),
        );
        let mut state = ProcessState::default();
        state.set("wait", json!(30), "start");

        let result = DelayExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        // 30 minutes > inline cap: waits
        assert!(result.is_waiting());
    }

    #[tokio::test]
    async fn test_delay_caps_at_max_wait() {
        let node = make_node(
            NodeType::Delay,
            json!({"delay_type": "hours", "duration": 100, "max_wait_seconds": 7200}),
        );
        let mut state = ProcessState::default();

        let result = DelayExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert_eq!(
            result.waiting_metadata.unwrap()["wait_seconds"],
            json!(7200.0)
        );
    }

    #[tokio::test]
    async fn test_delay_past_datetime_continues() {
        let node = make_node(
            NodeType::Delay,
            json!({"delay_type": "until_datetime", "until": "2020-01-01T00:00:00Z"}),
        );
        let mut state = ProcessState::default();

        let result = DelayExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert!(result.is_success());
        assert_eq!(result.output.unwrap()["delayed_seconds"], json!(0.0));
    }

    #[tokio::test]
    async fn test_schedule_past_datetime_continues() {
        let node = make_node(
            NodeType::Schedule,
            json!({"schedule_type": "datetime", "datetime": "2020-01-01T00:00:00Z"}),
        );
        let mut state = ProcessState::default();

        let result = ScheduleExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert_eq!(result.output.unwrap()["reason"], json!("past_schedule"));
    }

    #[tokio::test]
    async fn test_schedule_future_datetime_waits() {
        let future = (Utc::now() + Duration::days(3)).to_rfc3339();
        let node = make_node(
            NodeType::Schedule,
            json!({"schedule_type": "datetime", "datetime": future}),
        );
        let mut state = ProcessState::default();

        let result = ScheduleExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert_eq!(result.waiting_for, Some(WaitingKind::Schedule));
    }

    #[test]
    fn test_business_hours_weekend_and_holiday_skipping() {
        let config = json!({
            "start_hour": 9,
            "end_hour": 17,
            "weekdays_only": true,
            "timezone": "UTC",
            "holidays": ["2026-01-05"]
        });
        let hours = BusinessHours::from_config(config.as_object().unwrap());

        // Friday 2026-01-02 18:00 UTC: after hours; Monday the 5th is a
        // holiday, so the next window opens Tuesday the 6th at 09:00
        let local = chrono_tz::UTC
            .with_ymd_and_hms(2026, 1, 2, 18, 0, 0)
            .unwrap();
        assert!(!hours.is_open(local));
        let next = hours.next_open(local).unwrap();
        assert_eq!(
            next,
            Utc.with_ymd_and_hms(2026, 1, 6, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_business_hours_custom_day_window() {
        let config = json!({
            "start_hour": 9,
            "end_hour": 17,
            "timezone": "UTC",
            "custom_days": {"friday": {"start": 10, "end": 14}}
        });
        let hours = BusinessHours::from_config(config.as_object().unwrap());

        // Friday 2026-01-02 09:30 is before the custom 10:00 start
        let early = chrono_tz::UTC
            .with_ymd_and_hms(2026, 1, 2, 9, 30, 0)
            .unwrap();
        assert!(!hours.is_open(early));
        let open = chrono_tz::UTC
            .with_ymd_and_hms(2026, 1, 2, 11, 0, 0)
            .unwrap();
        assert!(hours.is_open(open));
    }

    #[test]
    fn test_business_hours_timezone() {
        let config = json!({
            "start_hour": 9,
            "end_hour": 17,
            "timezone": "America/New_York"
        });
        let hours = BusinessHours::from_config(config.as_object().unwrap());

        // 14:00 UTC on a Wednesday is 09:00 or 10:00 in New York: open
        let utc_now = Utc.with_ymd_and_hms(2026, 1, 7, 15, 0, 0).unwrap();
        assert!(hours.is_open(utc_now.with_timezone(&hours.timezone)));
    }

    #[tokio::test]
    async fn test_event_wait_metadata() {
        let node = make_node(
            NodeType::EventWait,
            json!({
                "event_type": "webhook",
                "event_filter": "payload.kind == 'done'",
                "timeout_seconds": 60,
                "timeout_action": "skip"
            }),
        );
        let mut state = ProcessState::default();

        let result = EventWaitExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert_eq!(result.waiting_for, Some(WaitingKind::Event));
        let metadata = result.waiting_metadata.unwrap();
        assert_eq!(metadata["event_type"], json!("webhook"));
        assert_eq!(metadata["timeout_action"], json!("skip"));
        assert_eq!(metadata["node_id"], json!("t1"));
    }
}
