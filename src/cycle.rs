//! Cycle-window calculation
//!
//! Pure calendar arithmetic mapping a reset configuration, an anchor and
//! a point in time to the enclosing half-open window `[start, end)`.
//! The function is total: bad inputs produce `None`, never a panic, and
//! the same inputs always produce the same window.

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Calendar interval a cycle advances by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

/// Whether the plan recurs or covers a single fixed range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Recurring,
    Onetime,
}

/// Billing or reset cadence for a feature plan version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Human-readable label ("monthly", "annual", ...)
    pub name: String,
    pub interval: BillingInterval,
    pub interval_count: u32,
    pub plan_type: PlanType,
    /// Alignment anchor in epoch milliseconds; defaults to the grant's
    /// effective start when unset
    pub anchor: Option<i64>,
}

impl CycleConfig {
    /// Shorthand for a recurring config without an explicit anchor
    #[must_use]
    pub fn recurring(name: &str, interval: BillingInterval, interval_count: u32) -> Self {
        Self {
            name: name.to_string(),
            interval,
            interval_count,
            plan_type: PlanType::Recurring,
            anchor: None,
        }
    }

    /// Shorthand for a one-time config covering the whole grant range
    #[must_use]
    pub fn onetime(name: &str) -> Self {
        Self {
            name: name.to_string(),
            interval: BillingInterval::Month,
            interval_count: 1,
            plan_type: PlanType::Onetime,
            anchor: None,
        }
    }
}

/// Half-open time window `[start, end)` in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleWindow {
    pub start: i64,
    pub end: i64,
}

impl CycleWindow {
    #[must_use]
    pub const fn contains(&self, t: i64) -> bool {
        t >= self.start && t < self.end
    }

    #[must_use]
    pub const fn len_ms(&self) -> i64 {
        self.end - self.start
    }
}

const MS_PER_MINUTE: i64 = 60 * 1000;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;
const MS_PER_WEEK: i64 = 7 * MS_PER_DAY;

/// Compute the cycle window containing `now`
///
/// Returns `None` when `now` lies outside `[effective_start,
/// effective_end)` or the configuration cannot produce a window.
/// `trial_ends_at`, when set, clamps the window end.
#[must_use]
pub fn cycle_window(
    effective_start: i64,
    effective_end: Option<i64>,
    now: i64,
    config: &CycleConfig,
    trial_ends_at: Option<i64>,
) -> Option<CycleWindow> {
    if now < effective_start {
        return None;
    }
    if let Some(end) = effective_end {
        if now >= end {
            return None;
        }
    }
    if config.interval_count == 0 {
        return None;
    }

    let raw = match config.plan_type {
        PlanType::Onetime => CycleWindow {
            start: effective_start,
            end: effective_end.unwrap_or(i64::MAX),
        },
        PlanType::Recurring => {
            let anchor = config
                .anchor
                .filter(|a| *a <= now)
                .unwrap_or(effective_start);
            anchored_window(anchor, now, config)?
        }
    };

    clamp_window(raw, effective_start, effective_end, trial_ends_at, now)
}

/// Largest anchored window `[start, start + step)` with `start <= now < end`
fn anchored_window(anchor: i64, now: i64, config: &CycleConfig) -> Option<CycleWindow> {
    let count = i64::from(config.interval_count);
    match config.interval {
        BillingInterval::Minute => fixed_window(anchor, now, MS_PER_MINUTE.checked_mul(count)?),
        BillingInterval::Hour => fixed_window(anchor, now, MS_PER_HOUR.checked_mul(count)?),
        BillingInterval::Day => fixed_window(anchor, now, MS_PER_DAY.checked_mul(count)?),
        BillingInterval::Week => fixed_window(anchor, now, MS_PER_WEEK.checked_mul(count)?),
        BillingInterval::Month => calendar_window(anchor, now, config.interval_count),
        BillingInterval::Year => calendar_window(anchor, now, config.interval_count.checked_mul(12)?),
    }
}

fn fixed_window(anchor: i64, now: i64, span_ms: i64) -> Option<CycleWindow> {
    if span_ms <= 0 {
        return None;
    }
    let elapsed = now.checked_sub(anchor)?;
    let k = elapsed.div_euclid(span_ms);
    let start = anchor.checked_add(k.checked_mul(span_ms)?)?;
    let end = start.checked_add(span_ms)?;
    Some(CycleWindow { start, end })
}

/// Month-granular stepping anchored on the anchor's day-of-month.
/// `chrono` clamps short months (an anchor on the 31st lands on the 28th
/// of February), which keeps advancement monotonic.
fn calendar_window(anchor: i64, now: i64, step_months: u32) -> Option<CycleWindow> {
    if step_months == 0 {
        return None;
    }
    let anchor_dt = to_datetime(anchor)?;
    let now_dt = to_datetime(now)?;

    let elapsed_months = (i64::from(now_dt.year()) - i64::from(anchor_dt.year())) * 12
        + (i64::from(now_dt.month0()) - i64::from(anchor_dt.month0()));
    let steps = elapsed_months.div_euclid(i64::from(step_months)).max(0);
    let steps = u32::try_from(steps.checked_mul(i64::from(step_months))?).ok()?;

    let mut start = anchor_dt.checked_add_months(Months::new(steps))?;
    // Day-of-month clamping can leave the candidate one step ahead or
    // behind of `now`; settle on the window that actually contains it.
    while start > now_dt {
        start = start.checked_sub_months(Months::new(step_months))?;
    }
    loop {
        let next = start.checked_add_months(Months::new(step_months))?;
        if next > now_dt {
            return Some(CycleWindow {
                start: start.timestamp_millis(),
                end: next.timestamp_millis(),
            });
        }
        start = next;
    }
}

fn clamp_window(
    raw: CycleWindow,
    effective_start: i64,
    effective_end: Option<i64>,
    trial_ends_at: Option<i64>,
    now: i64,
) -> Option<CycleWindow> {
    let start = raw.start.max(effective_start);
    let mut end = raw.end;
    if let Some(e) = effective_end {
        end = end.min(e);
    }
    if let Some(t) = trial_ends_at {
        if t > start {
            end = end.min(t);
        }
    }
    let window = CycleWindow { start, end };
    window.contains(now).then_some(window)
}

fn to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(s: &str) -> i64 {
        DateTime::parse_from_rfc3339(s).unwrap().timestamp_millis()
    }

    #[test]
    fn test_onetime_spans_effective_range() {
        let config = CycleConfig::onetime("once");
        let window = cycle_window(1_000, Some(9_000), 5_000, &config, None).unwrap();
        assert_eq!(window, CycleWindow { start: 1_000, end: 9_000 });
    }

    #[test]
    fn test_onetime_open_ended() {
        let config = CycleConfig::onetime("once");
        let window = cycle_window(1_000, None, 5_000, &config, None).unwrap();
        assert_eq!(window.start, 1_000);
        assert_eq!(window.end, i64::MAX);
    }

    #[test]
    fn test_outside_effective_range() {
        let config = CycleConfig::recurring("monthly", BillingInterval::Month, 1);
        assert!(cycle_window(1_000, None, 500, &config, None).is_none());
        assert!(cycle_window(1_000, Some(2_000), 2_000, &config, None).is_none());
    }

    #[test]
    fn test_monthly_window_boundaries() {
        let config = CycleConfig::recurring("monthly", BillingInterval::Month, 1);
        let start = ms("2024-01-01T00:00:00Z");
        let now = ms("2024-01-31T23:59:00Z");
        let window = cycle_window(start, None, now, &config, None).unwrap();
        assert_eq!(window.start, ms("2024-01-01T00:00:00Z"));
        assert_eq!(window.end, ms("2024-02-01T00:00:00Z"));

        // one second into February rolls the window over
        let now = ms("2024-02-01T00:00:01Z");
        let window = cycle_window(start, None, now, &config, None).unwrap();
        assert_eq!(window.start, ms("2024-02-01T00:00:00Z"));
        assert_eq!(window.end, ms("2024-03-01T00:00:00Z"));
    }

    #[test]
    fn test_monthly_anchor_day_clamps() {
        let config = CycleConfig {
            anchor: Some(ms("2024-01-31T00:00:00Z")),
            ..CycleConfig::recurring("monthly", BillingInterval::Month, 1)
        };
        let start = ms("2024-01-31T00:00:00Z");
        let now = ms("2024-03-01T12:00:00Z");
        let window = cycle_window(start, None, now, &config, None).unwrap();
        // Jan 31 anchor clamps to Feb 29 in a leap year
        assert_eq!(window.start, ms("2024-02-29T00:00:00Z"));
        assert!(window.contains(now));
    }

    #[test]
    fn test_daily_window_is_fixed_width() {
        let config = CycleConfig::recurring("daily", BillingInterval::Day, 1);
        let start = ms("2024-06-01T00:00:00Z");
        let now = ms("2024-06-03T10:00:00Z");
        let window = cycle_window(start, None, now, &config, None).unwrap();
        assert_eq!(window.start, ms("2024-06-03T00:00:00Z"));
        assert_eq!(window.len_ms(), MS_PER_DAY);
    }

    #[test]
    fn test_multi_week_interval() {
        let config = CycleConfig::recurring("biweekly", BillingInterval::Week, 2);
        let start = ms("2024-06-03T00:00:00Z");
        let now = ms("2024-06-20T00:00:00Z");
        let window = cycle_window(start, None, now, &config, None).unwrap();
        assert_eq!(window.start, ms("2024-06-17T00:00:00Z"));
        assert_eq!(window.len_ms(), 2 * MS_PER_WEEK);
    }

    #[test]
    fn test_first_window_clamped_to_effective_start() {
        // anchor predates the grant: the first window starts at the grant
        let config = CycleConfig {
            anchor: Some(ms("2024-01-01T00:00:00Z")),
            ..CycleConfig::recurring("monthly", BillingInterval::Month, 1)
        };
        let start = ms("2024-01-15T00:00:00Z");
        let now = ms("2024-01-20T00:00:00Z");
        let window = cycle_window(start, None, now, &config, None).unwrap();
        assert_eq!(window.start, start);
        assert_eq!(window.end, ms("2024-02-01T00:00:00Z"));
    }

    #[test]
    fn test_trial_clamps_window_end() {
        let config = CycleConfig::recurring("monthly", BillingInterval::Month, 1);
        let start = ms("2024-01-01T00:00:00Z");
        let trial_end = ms("2024-01-15T00:00:00Z");
        let now = ms("2024-01-10T00:00:00Z");
        let window = cycle_window(start, None, now, &config, Some(trial_end)).unwrap();
        assert_eq!(window.end, trial_end);

        // past the trial end there is no window
        let now = ms("2024-01-16T00:00:00Z");
        assert!(cycle_window(start, None, now, &config, Some(trial_end)).is_none());
    }

    #[test]
    fn test_referential_transparency() {
        let config = CycleConfig::recurring("hourly", BillingInterval::Hour, 6);
        let start = ms("2024-06-01T00:00:00Z");
        let now = ms("2024-06-02T13:30:00Z");
        let a = cycle_window(start, None, now, &config, None);
        let b = cycle_window(start, None, now, &config, None);
        assert_eq!(a, b);
        assert!(a.unwrap().contains(now));
    }

    #[test]
    fn test_zero_interval_count_is_total() {
        let config = CycleConfig {
            interval_count: 0,
            ..CycleConfig::recurring("broken", BillingInterval::Day, 1)
        };
        assert!(cycle_window(0, None, 1_000, &config, None).is_none());
    }
}
