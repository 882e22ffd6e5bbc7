use std::{net::Ipv4Addr, sync::Arc, thread};

use anyhow::{Result, ensure};

use crate::{
    datapath::Datapath,
    shim::CongestionOps,
    sock::{AckSample, RateSample, Sock, TcpSock},
};

const SOCK_ADDR_BASE: u64 = 0xffff_8880_1000_0000;
const SOCK_ADDR_STRIDE: u64 = 0x1000;
const TCP_INFINITE_SSTHRESH: u32 = 0x7fff_ffff;
const FIRST_EPHEMERAL_PORT: u16 = 32768;

#[derive(Clone, Copy, Debug)]
pub struct HarnessOptions {
    pub mss: u32,
    /// Initial window, in packets.
    pub init_cwnd: u32,
    /// Packets the peer acks per tick, at most what is in flight.
    pub acks_per_tick: u32,
    /// Bytes the application writes per tick.
    pub app_bytes_per_tick: u32,
    pub tick_us: u32,
    pub rtt_us: u32,
    /// Initial sequence number for every flow.
    pub isn: u32,
    pub local: Ipv4Addr,
    pub remote: Ipv4Addr,
    pub remote_port: u16,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            mss: 1448,
            init_cwnd: 10,
            acks_per_tick: 8,
            app_bytes_per_tick: 64 * 1024,
            tick_us: 10_000,
            rtt_us: 20_000,
            isn: 0,
            local: Ipv4Addr::new(10, 0, 0, 1),
            remote: Ipv4Addr::new(10, 0, 0, 2),
            remote_port: 5201,
        }
    }
}

impl HarnessOptions {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.mss > 0, "mss must be greater than zero");
        ensure!(self.init_cwnd > 0, "initial window must be greater than zero");
        ensure!(self.tick_us > 0, "tick must be greater than zero");
        Ok(())
    }
}

/// Synthetic host stack. Calls the hooks in kernel order: `init` on
/// connect, `cong_control` then `pkts_acked` per ack, `release` on close.
pub struct HostHarness<A: CongestionOps> {
    ops: A,
    datapath: Arc<Datapath>,
    opts: HarnessOptions,
    flows: Vec<Sock<A::Data>>,
    opened: u64,
    ticks: u64,
}

impl<A: CongestionOps> HostHarness<A> {
    pub fn new(ops: A, datapath: Arc<Datapath>, opts: HarnessOptions) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            ops,
            datapath,
            opts,
            flows: Vec::new(),
            opened: 0,
            ticks: 0,
        })
    }

    /// Connects a new flow and runs `init` on it. Returns its flow key.
    pub fn open_flow(&mut self) -> u64 {
        let n = self.opened;
        self.opened += 1;
        let tcp = TcpSock {
            sock_addr: SOCK_ADDR_BASE + n * SOCK_ADDR_STRIDE,
            src_ip: u32::from(self.opts.local),
            src_port: FIRST_EPHEMERAL_PORT.wrapping_add(n as u16),
            dst_ip: u32::from(self.opts.remote),
            dst_port: self.opts.remote_port,
            snd_cwnd: self.opts.init_cwnd,
            snd_ssthresh: TCP_INFINITE_SSTHRESH,
            mss_cache: self.opts.mss,
            snd_una: self.opts.isn,
            write_seq: self.opts.isn,
            ..TcpSock::default()
        };
        self.open_sock(tcp)
    }

    /// Runs `init` on a caller-built socket, e.g. to reuse an address.
    pub fn open_sock(&mut self, tcp: TcpSock) -> u64 {
        let mut sk = Sock::new(tcp);
        self.ops.init(&self.datapath, &mut sk);
        let key = sk.flow_key();
        self.flows.push(sk);
        key
    }

    /// One ack round for every open flow, in order.
    pub fn tick(&mut self) {
        let tick = self.ticks;
        for sk in &mut self.flows {
            step_flow(&self.ops, &self.datapath, &self.opts, tick, sk);
        }
        self.ticks += 1;
    }

    /// Runs `release` and forgets the flow.
    pub fn close_flow(&mut self, key: u64) -> bool {
        match self.flows.iter().position(|sk| sk.flow_key() == key) {
            Some(idx) => {
                let mut sk = self.flows.swap_remove(idx);
                self.ops.release(&self.datapath, &mut sk);
                true
            }
            None => false,
        }
    }

    pub fn close_all(&mut self) {
        for mut sk in self.flows.drain(..) {
            self.ops.release(&self.datapath, &mut sk);
        }
    }

    pub fn flows(&self) -> &[Sock<A::Data>] {
        &self.flows
    }

    pub fn flow(&self, key: u64) -> Option<&Sock<A::Data>> {
        self.flows.iter().find(|sk| sk.flow_key() == key)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

impl<A> HostHarness<A>
where
    A: CongestionOps + Sync,
    A::Data: Send,
{
    /// Like `tick`, but flows are split across `workers` threads so hooks
    /// for different flows run concurrently against the shared datapath.
    pub fn tick_parallel(&mut self, workers: usize) {
        let workers = workers.max(1);
        if workers == 1 || self.flows.len() < 2 {
            self.tick();
            return;
        }
        let tick = self.ticks;
        let chunk = self.flows.len().div_ceil(workers);
        let ops = &self.ops;
        let dp = &*self.datapath;
        let opts = &self.opts;
        thread::scope(|scope| {
            for flows in self.flows.chunks_mut(chunk) {
                scope.spawn(move || {
                    for sk in flows {
                        step_flow(ops, dp, opts, tick, sk);
                    }
                });
            }
        });
        self.ticks += 1;
    }
}

fn step_flow<A: CongestionOps>(
    ops: &A,
    dp: &Datapath,
    opts: &HarnessOptions,
    tick: u64,
    sk: &mut Sock<A::Data>,
) {
    let (rs, sample) = advance(&mut sk.tcp, opts, tick);
    ops.cong_control(dp, sk, &rs);
    ops.pkts_acked(dp, sk, &sample);
}

/// Moves one socket's counters forward by a tick and returns the samples
/// the stack would hand to the hooks for it.
fn advance(tp: &mut TcpSock, opts: &HarnessOptions, tick: u64) -> (RateSample, AckSample) {
    let mss = tp.mss_cache.max(1);
    tp.write_seq = tp.write_seq.wrapping_add(opts.app_bytes_per_tick);

    let acked = opts.acks_per_tick.min(tp.packets_out);
    let acked_bytes = acked * mss;
    tp.packets_out -= acked;
    tp.snd_una = tp.snd_una.wrapping_add(acked_bytes);
    tp.bytes_acked = tp.bytes_acked.wrapping_add(acked_bytes as u64);

    // every eighth round the peer reports one segment out of order
    tp.sacked_out = u32::from(tick % 8 == 7).min(tp.packets_out);

    let snd_nxt = tp.snd_una.wrapping_add(tp.packets_out * mss);
    let unsent = tp.write_seq.wrapping_sub(snd_nxt) / mss;
    let room = tp.snd_cwnd.saturating_sub(tp.packets_in_flight());
    tp.packets_out += unsent.min(room);

    let rs = RateSample {
        delivered: acked,
        snd_interval_us: opts.tick_us,
        rcv_interval_us: opts.tick_us,
        losses: 0,
        acked_sacked: acked + tp.sacked_out,
        rtt_us: if acked > 0 { opts.rtt_us as i64 } else { -1 },
    };
    let sample = AckSample {
        pkts_acked: acked,
        rtt_us: if acked > 0 { opts.rtt_us as i32 } else { -1 },
        in_flight: tp.packets_in_flight(),
    };
    (rs, sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datapath::{DatapathConfig, tests::datapath},
        shim::CcpShim,
    };

    fn harness(config: DatapathConfig, opts: HarnessOptions) -> HostHarness<CcpShim> {
        HostHarness::new(CcpShim, Arc::new(datapath(config)), opts).unwrap()
    }

    #[test]
    fn open_tick_close_produces_create_signals_free() {
        let mut h = harness(DatapathConfig::default(), HarnessOptions::default());
        let key = h.open_flow();
        for _ in 0..5 {
            h.tick();
        }
        assert!(h.close_flow(key));
        assert!(!h.close_flow(key));

        let dp = &h.datapath;
        assert_eq!(dp.create_events.len(), 1);
        assert_eq!(dp.signals.len(), 5);
        assert_eq!(dp.free_events.len(), 1);
        assert!(dp.connections.is_empty());
    }

    #[test]
    fn acked_bytes_sum_to_the_counter() {
        let mut h = harness(DatapathConfig::default(), HarnessOptions::default());
        let key = h.open_flow();
        for _ in 0..20 {
            h.tick();
        }
        let total: u64 = std::iter::from_fn(|| h.datapath.signals.pop())
            .map(|s| s.bytes_acked as u64)
            .sum();
        assert_eq!(h.flow(key).map(|sk| sk.tcp.bytes_acked), Some(total));
        assert!(total > 0);
    }

    #[test]
    fn sequence_wrap_keeps_pending_small() {
        let opts = HarnessOptions {
            isn: u32::MAX - 10_000,
            ..HarnessOptions::default()
        };
        let mut h = harness(DatapathConfig::default(), opts);
        h.open_flow();
        for _ in 0..4 {
            h.tick();
        }
        while let Some(signal) = h.datapath.signals.pop() {
            assert!(signal.bytes_pending <= 4 * opts.app_bytes_per_tick);
        }
    }

    #[test]
    fn flows_beyond_capacity_get_no_rows() {
        let mut h = harness(
            DatapathConfig {
                max_flows: 3,
                ..DatapathConfig::default()
            },
            HarnessOptions::default(),
        );
        for _ in 0..5 {
            h.open_flow();
        }
        h.tick();
        assert_eq!(h.datapath.connections.len(), 3);
        assert_eq!(h.datapath.create_events.len(), 3);
        assert_eq!(h.datapath.signals.len(), 3);
        assert_eq!(h.datapath.stats().rejected_at_capacity, 2);
    }

    #[test]
    fn parallel_ticks_match_sequential_accounting() {
        let mut h = harness(DatapathConfig::default(), HarnessOptions::default());
        for _ in 0..16 {
            h.open_flow();
        }
        for _ in 0..10 {
            h.tick_parallel(4);
        }
        assert_eq!(h.ticks(), 10);
        assert_eq!(h.datapath.signals.len(), 160);
        h.close_all();
        assert!(h.flows().is_empty());
        assert_eq!(h.datapath.free_events.len(), 16);
        assert!(h.datapath.connections.is_empty());
    }

    #[test]
    fn zero_mss_is_rejected() {
        let opts = HarnessOptions {
            mss: 0,
            ..HarnessOptions::default()
        };
        let dp = Arc::new(datapath(DatapathConfig::default()));
        assert!(HostHarness::new(CcpShim, dp, opts).is_err());
    }
}
