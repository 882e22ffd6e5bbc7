use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{Result, ensure};
use chrono::Utc;

use ccp_shim_common::{
    CHANNEL_CAPACITY, COMMAND_DRAIN_BOUND, CommandRequest, CommandResponse, CreateConnEvent,
    FreeConnEvent, MAX_FLOWS, MTU, Signal,
};

use crate::{channel::Channel, table::ConnectionTable};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DatapathConfig {
    pub max_flows: usize,
    pub channel_capacity: usize,
    pub command_drain_bound: usize,
    pub mtu: u32,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            max_flows: MAX_FLOWS,
            channel_capacity: CHANNEL_CAPACITY,
            command_drain_bound: COMMAND_DRAIN_BOUND,
            mtu: MTU,
        }
    }
}

impl DatapathConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_flows > 0, "max flows must be greater than zero");
        ensure!(
            self.channel_capacity > 0,
            "channel capacity must be greater than zero"
        );
        ensure!(
            self.command_drain_bound > 0,
            "command drain bound must be greater than zero"
        );
        ensure!(self.mtu > 0, "mtu must be greater than zero");
        Ok(())
    }
}

/// Source of the timestamp returned to `Timestamp` commands.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        Utc::now().timestamp_micros().max(0) as u64
    }
}

#[derive(Default)]
pub struct DatapathStats {
    pub admitted: AtomicU64,
    pub rejected_at_capacity: AtomicU64,
    pub released: AtomicU64,
    pub signals_emitted: AtomicU64,
    pub controls_applied: AtomicU64,
    pub commands_handled: AtomicU64,
    pub commands_unknown: AtomicU64,
}

impl DatapathStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the datapath counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatsSnapshot {
    pub active_flows: usize,
    pub admitted: u64,
    pub rejected_at_capacity: u64,
    pub released: u64,
    pub signals_emitted: u64,
    pub signals_dropped: u64,
    pub lifecycle_dropped: u64,
    pub controls_applied: u64,
    pub commands_handled: u64,
    pub commands_unknown: u64,
    pub responses_dropped: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flows: {} admitted: {} rejected: {} released: {} signals: {} (dropped {}) lifecycle dropped: {} controls: {} commands: {} (unknown {}) responses dropped: {}",
            self.active_flows,
            self.admitted,
            self.rejected_at_capacity,
            self.released,
            self.signals_emitted,
            self.signals_dropped,
            self.lifecycle_dropped,
            self.controls_applied,
            self.commands_handled,
            self.commands_unknown,
            self.responses_dropped
        )
    }
}

/// Context object every hook receives.
pub struct Datapath {
    pub config: DatapathConfig,
    pub connections: ConnectionTable,
    pub signals: Channel<Signal>,
    pub create_events: Channel<CreateConnEvent>,
    pub free_events: Channel<FreeConnEvent>,
    pub requests: Channel<CommandRequest>,
    pub responses: Channel<CommandResponse>,
    pub stats: DatapathStats,
    clock: Box<dyn Clock>,
}

impl Datapath {
    pub fn new(config: DatapathConfig) -> Result<Self> {
        Self::with_clock(config, Box::new(SystemClock))
    }

    pub fn with_clock(config: DatapathConfig, clock: Box<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let cap = config.channel_capacity;
        Ok(Self {
            config,
            connections: ConnectionTable::new(config.max_flows),
            signals: Channel::with_capacity(cap),
            create_events: Channel::with_capacity(cap),
            free_events: Channel::with_capacity(cap),
            requests: Channel::with_capacity(cap),
            responses: Channel::with_capacity(cap),
            stats: DatapathStats::default(),
            clock,
        })
    }

    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let s = &self.stats;
        StatsSnapshot {
            active_flows: self.connections.len(),
            admitted: s.admitted.load(Ordering::Relaxed),
            rejected_at_capacity: s.rejected_at_capacity.load(Ordering::Relaxed),
            released: s.released.load(Ordering::Relaxed),
            signals_emitted: s.signals_emitted.load(Ordering::Relaxed),
            signals_dropped: self.signals.dropped(),
            lifecycle_dropped: self.create_events.dropped() + self.free_events.dropped(),
            controls_applied: s.controls_applied.load(Ordering::Relaxed),
            commands_handled: s.commands_handled.load(Ordering::Relaxed),
            commands_unknown: s.commands_unknown.load(Ordering::Relaxed),
            responses_dropped: self.responses.dropped(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, atomic::AtomicU64};

    /// Clock that returns whatever the test stored last.
    #[derive(Clone, Default)]
    pub(crate) struct FixedClock(Arc<AtomicU64>);

    impl FixedClock {
        pub(crate) fn set(&self, us: u64) {
            self.0.store(us, Ordering::Relaxed);
        }
    }

    impl Clock for FixedClock {
        fn now_us(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    pub(crate) fn datapath_with_clock(config: DatapathConfig) -> (Datapath, FixedClock) {
        let clock = FixedClock::default();
        let dp = Datapath::with_clock(config, Box::new(clock.clone())).unwrap();
        (dp, clock)
    }

    pub(crate) fn datapath(config: DatapathConfig) -> Datapath {
        datapath_with_clock(config).0
    }

    #[test]
    fn default_config_matches_wire_constants() {
        let cfg = DatapathConfig::default();
        assert_eq!(cfg.max_flows, 1024);
        assert_eq!(cfg.channel_capacity, 1024);
        assert_eq!(cfg.mtu, 1500);
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_values_are_rejected() {
        for cfg in [
            DatapathConfig {
                max_flows: 0,
                ..DatapathConfig::default()
            },
            DatapathConfig {
                channel_capacity: 0,
                ..DatapathConfig::default()
            },
            DatapathConfig {
                command_drain_bound: 0,
                ..DatapathConfig::default()
            },
            DatapathConfig {
                mtu: 0,
                ..DatapathConfig::default()
            },
        ] {
            assert!(Datapath::new(cfg).is_err());
        }
    }

    #[test]
    fn stats_fold_in_channel_drops() {
        let dp = datapath(DatapathConfig {
            channel_capacity: 1,
            ..DatapathConfig::default()
        });
        dp.signals.push(Signal::default());
        dp.signals.push(Signal::default());
        dp.free_events.push(FreeConnEvent::default());
        dp.free_events.push(FreeConnEvent::default());
        let stats = dp.stats();
        assert_eq!(stats.signals_dropped, 1);
        assert_eq!(stats.lifecycle_dropped, 1);
    }
}
