//! Aggregation method semantics
//!
//! Maps each aggregation method to its `(behavior, scope, resets)`
//! triple. The table is compile-time and total; the meter and the
//! reconciler key their decisions off it.

use serde::{Deserialize, Serialize};

/// How usage events are folded into the meter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    /// No metering; flat feature gate
    None,
    /// Sum of reported deltas within the cycle
    Sum,
    /// One unit per event within the cycle
    Count,
    /// Maximum reported value within the cycle
    Max,
    /// Last reported value within the cycle
    LastDuringPeriod,
    /// Sum over the whole grant lifetime
    SumAll,
    /// One unit per event over the whole grant lifetime
    CountAll,
    /// Maximum over the whole grant lifetime
    MaxAll,
}

/// Folding behavior applied by the meter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationBehavior {
    None,
    Sum,
    Max,
    Last,
}

/// Whether the effective window is the cycle or the merged grant range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationScope {
    Period,
    Lifetime,
}

/// Resolved semantics for one aggregation method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationConfig {
    pub behavior: AggregationBehavior,
    pub scope: AggregationScope,
    pub resets: bool,
}

impl AggregationMethod {
    /// Resolve the `(behavior, scope, resets)` triple for this method
    #[must_use]
    pub const fn config(self) -> AggregationConfig {
        use AggregationBehavior as B;
        use AggregationScope as S;

        match self {
            Self::None => AggregationConfig {
                behavior: B::None,
                scope: S::Period,
                resets: true,
            },
            Self::Sum | Self::Count => AggregationConfig {
                behavior: B::Sum,
                scope: S::Period,
                resets: true,
            },
            Self::Max => AggregationConfig {
                behavior: B::Max,
                scope: S::Period,
                resets: true,
            },
            Self::LastDuringPeriod => AggregationConfig {
                behavior: B::Last,
                scope: S::Period,
                resets: true,
            },
            Self::SumAll | Self::CountAll => AggregationConfig {
                behavior: B::Sum,
                scope: S::Lifetime,
                resets: false,
            },
            Self::MaxAll => AggregationConfig {
                behavior: B::Max,
                scope: S::Lifetime,
                resets: false,
            },
        }
    }

    /// True for the count methods, which meter one unit per event
    #[must_use]
    pub const fn is_count(self) -> bool {
        matches!(self, Self::Count | Self::CountAll)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Max => "max",
            Self::LastDuringPeriod => "last_during_period",
            Self::SumAll => "sum_all",
            Self::CountAll => "count_all",
            Self::MaxAll => "max_all",
        }
    }
}
