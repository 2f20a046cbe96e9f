//! Synchronized state shared between apps.
//!
//! One context object owns every cross-app view, replacing implicit global
//! singletons. Readers hold a lock only for the duration of one message
//! handler; writers must not call into other components while holding one.
//!
//! Lock order: when topology and config are needed together, take topology
//! FIRST, then config. These are the only two resources ever locked
//! together, which is sufficient to rule out deadlock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use lattice_primitives::MacAddr;
use lattice_primitives::wire::HaAppData;
use lattice_topology::TopologyView;

use crate::config::helper::ConfigHelper;
use crate::config::controller_config::ControllerConfigStore;
use crate::status::StatusEntry;

/// Offset between the Unix epoch (1970-01-01) and the GPS epoch
/// (1980-01-06), in microseconds.
pub const UNIX_GPS_EPOCH_DIFFERENCE_US: i64 = 315_964_800_000_000;

/// Process-wide GPS clock. The epoch is advanced from accepted minion
/// samples; `now` extrapolates with the monotonic clock since the last set.
#[derive(Debug)]
pub struct GpsClock {
    /// GPS microseconds at `set_at`, or 0 if never set.
    epoch_us: AtomicI64,
    set_at_monotonic_us: AtomicI64,
    start: Instant,
}

impl Default for GpsClock {
    fn default() -> Self {
        Self {
            epoch_us: AtomicI64::new(0),
            set_at_monotonic_us: AtomicI64::new(0),
            start: Instant::now(),
        }
    }
}

impl GpsClock {
    fn monotonic_us(&self) -> i64 {
        self.start.elapsed().as_micros() as i64
    }

    /// Current GPS time in microseconds, or 0 if the clock was never set.
    pub fn now_us(&self) -> i64 {
        let epoch = self.epoch_us.load(Ordering::Acquire);
        if epoch == 0 {
            return 0;
        }
        epoch + (self.monotonic_us() - self.set_at_monotonic_us.load(Ordering::Acquire))
    }

    pub fn set_epoch_us(&self, gps_us: i64) {
        self.set_at_monotonic_us
            .store(self.monotonic_us(), Ordering::Release);
        self.epoch_us.store(gps_us, Ordering::Release);
    }

    /// GPS time derived from the system clock, used as a fallback before the
    /// clock has been set from the fleet.
    pub fn system_fallback_us() -> i64 {
        let unix_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        unix_us - UNIX_GPS_EPOCH_DIFFERENCE_US
    }
}

/// Data queued for replication to the passive peer, plus the full snapshot
/// used for catch-up after a sequence mismatch.
#[derive(Debug, Default)]
pub struct SyncedAppData {
    pub pending: HaAppData,
    pub full: HaAppData,
}

impl SyncedAppData {
    pub fn clear(&mut self) {
        self.pending = HaAppData::default();
        self.full = HaAppData::default();
    }

    /// Record a change: it joins both the pending delta and the snapshot.
    pub fn record(&mut self, change: HaAppData) {
        self.pending.merge(change.clone());
        self.full.merge(change);
    }
}

/// The shared views. Cloning is cheap; all clones alias the same state.
#[derive(Clone)]
pub struct SharedState {
    pub topology: Arc<RwLock<TopologyView>>,
    pub status_reports: Arc<RwLock<BTreeMap<MacAddr, StatusEntry>>>,
    pub config: Arc<RwLock<ConfigHelper>>,
    pub controller_config: Arc<RwLock<ControllerConfigStore>>,
    pub synced_app_data: Arc<RwLock<SyncedAppData>>,
    pub gps_clock: Arc<GpsClock>,
}

impl SharedState {
    pub fn new(
        topology: TopologyView,
        config: ConfigHelper,
        controller_config: ControllerConfigStore,
    ) -> Self {
        Self {
            topology: Arc::new(RwLock::new(topology)),
            status_reports: Arc::new(RwLock::new(BTreeMap::new())),
            config: Arc::new(RwLock::new(config)),
            controller_config: Arc::new(RwLock::new(controller_config)),
            synced_app_data: Arc::new(RwLock::new(SyncedAppData::default())),
            gps_clock: Arc::new(GpsClock::default()),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Self {
        Self::new(
            TopologyView::default(),
            ConfigHelper::empty(),
            ControllerConfigStore::in_memory(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gps_clock_unset_reads_zero() {
        let clock = GpsClock::default();
        assert_eq!(clock.now_us(), 0);
    }

    #[test]
    fn gps_clock_advances_after_set() {
        let clock = GpsClock::default();
        clock.set_epoch_us(1_000_000);
        let now = clock.now_us();
        assert!(now >= 1_000_000, "clock went backwards: {now}");
    }

    #[test]
    fn synced_data_record_feeds_delta_and_snapshot() {
        let mut synced = SyncedAppData::default();
        synced.record(HaAppData {
            network_overrides: Some("{}".into()),
            ..Default::default()
        });
        assert!(!synced.pending.is_empty());
        assert!(!synced.full.is_empty());
        synced.pending = HaAppData::default();
        synced.record(HaAppData {
            node_overrides: Some("{}".into()),
            ..Default::default()
        });
        // snapshot keeps the earlier change, delta only the new one
        assert!(synced.full.network_overrides.is_some());
        assert!(synced.pending.network_overrides.is_none());
    }
}
