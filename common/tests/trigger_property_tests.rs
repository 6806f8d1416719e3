// Property-based tests for trigger resolution

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use common::errors::ValidationError;
use common::models::{JobIdentity, Trigger, TriggerKind};
use common::trigger::{next_firing, resolve, SchedulePlan, ONE_SHOT_INTERVAL_MS};
use proptest::prelude::*;

const NOW: i64 = 1_700_000_000_000;

fn name() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9_-]{0,20}"
}

/// *For any* queue and job name, resolving a `repeat` or `delay` trigger twice
/// yields the same identity.
#[test]
fn property_identity_is_deterministic() {
    proptest!(|(
        queue in name(),
        job in name(),
        minute in 0u32..60,
        offset in 1i64..1_000_000_000,
        skew in 0i64..1_000,
    )| {
        let now = Utc.timestamp_millis_opt(NOW).single().unwrap();
        let later = Utc.timestamp_millis_opt(NOW + skew).single().unwrap();

        let repeat = Trigger::Repeat(format!("{} * * * *", minute));
        let a = resolve(&queue, &job, &repeat, now, Tz::UTC).unwrap();
        let b = resolve(&queue, &job, &repeat, later, Tz::UTC).unwrap();
        prop_assert_eq!(&a.identity, &b.identity);
        prop_assert_eq!(a.identity.as_str(), format!("{}:{}:repeat", queue, job));

        let delay = Trigger::Delay(NOW + skew + offset);
        let a = resolve(&queue, &job, &delay, now, Tz::UTC).unwrap();
        let b = resolve(&queue, &job, &delay, later, Tz::UTC).unwrap();
        prop_assert_eq!(&a.identity, &b.identity);
        prop_assert_eq!(a.identity.as_str(), format!("{}:{}:delay", queue, job));
    });
}

/// *For any* two distinct submission stamps, `now` identities differ.
#[test]
fn property_now_identities_are_distinct() {
    proptest!(|(
        queue in name(),
        job in name(),
        first in 0i64..i64::MAX / 2,
        gap in 1i64..1_000_000,
    )| {
        let a = JobIdentity::new(&queue, &job, TriggerKind::Now, first);
        let b = JobIdentity::new(&queue, &job, TriggerKind::Now, first + gap);
        prop_assert_ne!(a, b);
    });
}

/// *For any* instant at or before now, a `delay` trigger is rejected.
#[test]
fn property_non_future_delay_is_rejected() {
    proptest!(|(back in 0i64..10_000_000_000)| {
        let now = Utc.timestamp_millis_opt(NOW).single().unwrap();
        let instant = NOW - back;
        let result = resolve("testQueue", "once", &Trigger::Delay(instant), now, Tz::UTC);
        prop_assert_eq!(result, Err(ValidationError::DelayNotInFuture { instant_ms: instant }));
    });
}

/// *For any* future instant, a `delay` trigger fires exactly at that instant
/// and never again.
#[test]
fn property_delay_fires_once_at_instant() {
    proptest!(|(ahead in 1i64..10_000_000_000)| {
        let now = Utc.timestamp_millis_opt(NOW).single().unwrap();
        let instant = NOW + ahead;
        let resolved = resolve("testQueue", "once", &Trigger::Delay(instant), now, Tz::UTC).unwrap();

        let SchedulePlan::Recurring(options) = resolved.plan else {
            return Err(TestCaseError::fail("delay must resolve to a recurring plan"));
        };
        prop_assert_eq!(options.limit, Some(1));
        prop_assert_eq!(options.every, Some(ONE_SHOT_INTERVAL_MS));
        prop_assert_eq!(next_firing(&options, NOW), Some(instant));
        prop_assert_eq!(next_firing(&options, instant + 1), None);
    });
}

/// *For any* valid 5-field pattern, the next firing lies strictly in the
/// future and on a whole minute.
#[test]
fn property_cron_next_firing_is_future_minute() {
    proptest!(|(
        minute in 0u32..60,
        hour in 0u32..24,
        now in NOW..NOW + 400 * 24 * 3_600_000,
    )| {
        let now_at = Utc.timestamp_millis_opt(now).single().unwrap();
        let pattern = format!("{} {} * * *", minute, hour);
        let resolved = resolve("q", "j", &Trigger::Repeat(pattern), now_at, Tz::UTC).unwrap();

        let SchedulePlan::Recurring(options) = resolved.plan else {
            return Err(TestCaseError::fail("repeat must resolve to a recurring plan"));
        };
        let next = next_firing(&options, now).unwrap();
        prop_assert!(next > now);
        prop_assert!(next - now <= 24 * 3_600_000);
        prop_assert_eq!(next % 60_000, 0);
    });
}
