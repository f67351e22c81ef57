//! Overload classification over [`Snapshotter`] windows (component #6,
//! spec.md §4.5).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::snapshotter::Snapshotter;

/// Per-metric and overall overload state at a point in time, returned by
/// [`SystemStatus::current_status`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SystemSnapshot {
    pub cpu_overloaded: bool,
    pub memory_overloaded: bool,
    pub event_loop_overloaded: bool,
    pub client_overloaded: bool,
}

impl SystemSnapshot {
    pub fn is_overloaded(&self) -> bool {
        self.cpu_overloaded || self.memory_overloaded || self.event_loop_overloaded || self.client_overloaded
    }
}

/// Window lengths and the ratio threshold above which a metric counts as
/// overloaded (spec.md §4.5 defaults).
#[derive(Debug, Clone, Copy)]
pub struct SystemStatusConfig {
    pub current_window: Duration,
    pub historical_window: Duration,
    pub max_overloaded_ratio: f64,
}

impl Default for SystemStatusConfig {
    fn default() -> Self {
        Self {
            current_window: Duration::from_secs(5),
            historical_window: Duration::from_secs(30),
            max_overloaded_ratio: 0.4,
        }
    }
}

/// Reads [`Snapshotter`] series and classifies overload over a "current"
/// (short, gates scale-up) and "historical" (long, gates scale-down) window.
pub struct SystemStatus {
    snapshotter: Arc<Snapshotter>,
    config: SystemStatusConfig,
}

impl SystemStatus {
    pub fn new(snapshotter: Arc<Snapshotter>, config: SystemStatusConfig) -> Self {
        Self { snapshotter, config }
    }

    fn snapshot_for(&self, window: Duration) -> SystemSnapshot {
        let threshold = self.config.max_overloaded_ratio;
        SystemSnapshot {
            cpu_overloaded: self.snapshotter.cpu_overloaded_ratio(window) > threshold,
            memory_overloaded: self.snapshotter.memory_overloaded_ratio(window) > threshold,
            event_loop_overloaded: self.snapshotter.event_loop_overloaded_ratio(window) > threshold,
            client_overloaded: self.snapshotter.client_overloaded_ratio(window) > threshold,
        }
    }

    /// Overload classification over the configured "current" window —
    /// what [`crate::autoscaled_pool::AutoscaledPool`] consults before
    /// scaling up.
    pub fn current_status(&self) -> SystemSnapshot {
        self.snapshot_for(self.config.current_window)
    }

    /// Overload classification over the configured "historical" window —
    /// what gates scale-down.
    pub fn historical_status(&self) -> SystemSnapshot {
        self.snapshot_for(self.config.historical_window)
    }

    pub fn is_currently_overloaded(&self) -> bool {
        self.current_status().is_overloaded()
    }

    pub fn is_historically_overloaded(&self) -> bool {
        self.historical_status().is_overloaded()
    }

    /// `hasBeenOverloaded(windowMs)`: any metric overloaded over an
    /// arbitrary caller-supplied window, independent of the two
    /// configured windows above.
    pub fn has_been_overloaded(&self, window: Duration) -> bool {
        self.snapshot_for(window).is_overloaded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshotter::SnapshotterConfig;

    #[test]
    fn overloaded_if_any_metric_exceeds_ratio() {
        let snapshotter = Arc::new(Snapshotter::new(SnapshotterConfig::default()));
        for _ in 0..10 {
            snapshotter.record_client_error();
        }
        let status = SystemStatus::new(snapshotter.clone(), SystemStatusConfig::default());
        // No samples pushed yet; nothing observed overloaded.
        assert!(!status.is_currently_overloaded());
    }

    #[test]
    fn has_been_overloaded_uses_arbitrary_window() {
        let snapshotter = Arc::new(Snapshotter::new(SnapshotterConfig::default()));
        let status = SystemStatus::new(snapshotter, SystemStatusConfig::default());
        assert!(!status.has_been_overloaded(Duration::from_millis(1)));
    }
}
