// Trigger resolution
//
// Maps an abstract trigger onto the backend's recurring-job configuration and
// a deterministic job identity. Everything here is pure: the caller supplies
// the current instant, so resolution never touches a clock or the network.

use crate::errors::ValidationError;
use crate::models::{instant_in_range, JobIdentity, RepeatOptions, Trigger, TriggerKind};
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Recurrence interval for one-shot jobs; only the first firing matters
pub const ONE_SHOT_INTERVAL_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// How the backend should be told about a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulePlan {
    /// Upsert a scheduler entry with this recurrence
    Recurring(RepeatOptions),
    /// Enqueue a single work item right away
    Immediate,
}

/// Result of resolving a trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTrigger {
    pub identity: JobIdentity,
    pub kind: TriggerKind,
    pub plan: SchedulePlan,
}

/// Resolve `(queue, job, trigger)` at instant `now`.
///
/// `tz` is the zone cron patterns are evaluated in and is only recorded on
/// `repeat` configurations.
pub fn resolve(
    queue: &str,
    job: &str,
    trigger: &Trigger,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<ResolvedTrigger, ValidationError> {
    let now_ms = now.timestamp_millis();
    let kind = trigger.kind();
    let identity = JobIdentity::new(queue, job, kind, now_ms);

    let plan = match trigger {
        Trigger::Repeat(pattern) => {
            parse_cron_pattern(pattern)?;
            SchedulePlan::Recurring(RepeatOptions {
                pattern: Some(pattern.clone()),
                tz: Some(tz.name().to_string()),
                ..RepeatOptions::default()
            })
        }
        Trigger::Delay(instant_ms) => {
            if !instant_in_range(*instant_ms) {
                return Err(ValidationError::InvalidFieldValue {
                    field: "trigger.data".into(),
                    reason: format!("{} is outside the supported date range", instant_ms),
                });
            }
            match instant_ms.checked_sub(now_ms) {
                Some(delay_ms) if delay_ms > 0 => {}
                _ => {
                    return Err(ValidationError::DelayNotInFuture {
                        instant_ms: *instant_ms,
                    })
                }
            }
            SchedulePlan::Recurring(RepeatOptions {
                every: Some(ONE_SHOT_INTERVAL_MS),
                limit: Some(1),
                start_date: Some(*instant_ms),
                end_date: Some(*instant_ms),
                ..RepeatOptions::default()
            })
        }
        Trigger::Now => SchedulePlan::Immediate,
    };

    Ok(ResolvedTrigger {
        identity,
        kind,
        plan,
    })
}

/// Parse a cron pattern, accepting the classic 5-field form.
///
/// The `cron` crate wants a leading seconds field, so 5-field patterns fire
/// at second zero of the matching minute.
pub fn parse_cron_pattern(pattern: &str) -> Result<CronSchedule, ValidationError> {
    let fields = pattern.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", pattern.trim())
    } else {
        pattern.trim().to_string()
    };

    CronSchedule::from_str(&normalized).map_err(|e| ValidationError::InvalidCronPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Next firing instant (epoch ms) of a recurrence, strictly after `now_ms`
/// unless the start date has not been reached yet.
///
/// Returns `None` when the recurrence can no longer fire.
pub fn next_firing(options: &RepeatOptions, now_ms: i64) -> Option<i64> {
    let next = if let Some(pattern) = &options.pattern {
        let schedule = parse_cron_pattern(pattern).ok()?;
        let tz = options
            .tz
            .as_deref()
            .and_then(|name| Tz::from_str(name).ok())
            .unwrap_or(Tz::UTC);
        let reference_ms = options.start_date.map_or(now_ms, |start| start.max(now_ms));
        let reference = tz.timestamp_millis_opt(reference_ms).single()?;
        schedule.after(&reference).next()?.timestamp_millis()
    } else if let Some(every) = options.every {
        let every = i64::try_from(every).ok().filter(|every| *every > 0)?;
        match options.start_date {
            Some(start) if start >= now_ms => start,
            Some(start) => {
                let periods = now_ms.checked_sub(start)? / every + 1;
                start.checked_add(periods.checked_mul(every)?)?
            }
            None => now_ms.checked_add(every)?,
        }
    } else {
        return None;
    };

    match options.end_date {
        Some(end) if next > end => None,
        _ => Some(next),
    }
}
