//! Latency to network-cost normalisation.
//!
//! Raw latencies are mapped linearly onto `[MIN_COST, MAX_COST]` using the
//! lowest and highest latency in the whole snapshot, not just the nodes in
//! scope for a pass. That keeps the scale stable across topologies that
//! cover different subsets of the cluster.

use serde::Serialize;

use crate::telemetry::LatencySnapshot;

/// Cost of the cheapest link, and of a node to itself.
pub const MIN_COST: u32 = 1;

/// Cost of the most expensive link.
pub const MAX_COST: u32 = 100;

/// Latency bounds observed in one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostRange {
    /// Lowest latency in the snapshot.
    pub lowest: f64,
    /// Highest latency in the snapshot.
    pub highest: f64,
}

impl CostRange {
    /// Computes the global range of a snapshot.
    ///
    /// An empty snapshot yields `0..0`, which maps every value to [`MIN_COST`].
    #[must_use]
    pub fn from_snapshot(snapshot: &LatencySnapshot) -> Self {
        let mut values = snapshot.values();
        let Some(first) = values.next() else {
            return Self {
                lowest: 0.0,
                highest: 0.0,
            };
        };

        values.fold(
            Self {
                lowest: first,
                highest: first,
            },
            |range, v| Self {
                lowest: range.lowest.min(v),
                highest: range.highest.max(v),
            },
        )
    }

    /// Width of the range.
    #[must_use]
    pub fn spread(&self) -> f64 {
        self.highest - self.lowest
    }

    /// Maps a latency onto the cost scale.
    ///
    /// `floor((v - lowest) * (MAX_COST - MIN_COST) / spread) + MIN_COST`,
    /// clamped to `[MIN_COST, MAX_COST]`. A zero-width range maps everything
    /// to [`MIN_COST`].
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::as_conversions
    )]
    pub fn normalize(&self, latency: f64) -> u32 {
        let spread = self.spread();
        if spread <= 0.0 || !latency.is_finite() {
            return MIN_COST;
        }
        // (v - lowest) * 99 / spread can round to just under 99 at the top.
        if latency >= self.highest {
            return MAX_COST;
        }

        let scaled = ((latency - self.lowest) * f64::from(MAX_COST - MIN_COST) / spread).floor();
        let bounded = scaled.clamp(0.0, f64::from(MAX_COST - MIN_COST)) as u32;
        bounded + MIN_COST
    }
}
