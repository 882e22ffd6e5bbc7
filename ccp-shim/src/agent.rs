use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, ensure};
use tokio::time;
use tracing::{debug, info, trace};

use ccp_shim_common::{
    CommandRequest, CommandResponse, CommandType, CreateConnEvent, FrameKind, FreeConnEvent,
    Signal,
};

use crate::{
    datapath::Datapath,
    model::{ConnectionRow, FlowInfo, connections_json},
    uplink::{Inbound, Uplink},
};

/// Updates the agent pushes into the connection table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlMessage {
    /// Flow key, congestion window in bytes.
    SetCwnd(u64, u32),
    /// Flow key, pacing rate in bytes/s.
    SetRateAbs(u64, u64),
}

/// Fixed targets handed to every new flow. Stands in for a real agent's
/// decision logic when driving the shim from the CLI.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StaticPolicy {
    pub cwnd_bytes: Option<u32>,
    pub pacing_rate: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PollSummary {
    pub created: usize,
    pub freed: usize,
    pub signals: usize,
    pub orphan_signals: usize,
    pub responses: usize,
    /// Messages taken from the agent socket.
    pub inbound: usize,
}

/// Plumbing an agent sits on. Consumes lifecycle events and signals, keeps
/// the registry of live flows, and pushes window/rate updates into the
/// connection table.
pub struct ControlPlane {
    datapath: Arc<Datapath>,
    policy: StaticPolicy,
    flows: HashMap<u64, FlowInfo>,
    // frees still owed to earlier flows whose key was already reused
    stale_frees: HashMap<u64, u32>,
    uplink: Option<Uplink>,
    last_timestamp: Option<u32>,
    totals: PollSummary,
}

impl ControlPlane {
    pub fn new(datapath: Arc<Datapath>, policy: StaticPolicy) -> Self {
        Self {
            datapath,
            policy,
            flows: HashMap::new(),
            stale_frees: HashMap::new(),
            uplink: None,
            last_timestamp: None,
            totals: PollSummary::default(),
        }
    }

    /// Mirrors every drained record to an out-of-process agent and accepts
    /// its commands and control messages.
    pub fn with_uplink(mut self, uplink: Uplink) -> Self {
        self.uplink = Some(uplink);
        self
    }

    pub fn uplink(&self) -> Option<&Uplink> {
        self.uplink.as_ref()
    }

    /// Drains every channel once, at most one channel's capacity each.
    ///
    /// Creates are consumed before signals and frees after them, so a flow
    /// that came and went between two polls still gets its signals
    /// attributed.
    pub fn poll(&mut self) -> PollSummary {
        let dp = self.datapath.clone();
        let bound = dp.config.channel_capacity;
        let mut summary = PollSummary {
            inbound: self.pump_uplink(bound),
            ..PollSummary::default()
        };

        summary.created = dp
            .create_events
            .drain_bounded(bound, |event| self.on_create(&event));
        dp.signals.drain_bounded(bound, |signal| {
            if self.on_signal(&signal) {
                summary.signals += 1;
            } else {
                summary.orphan_signals += 1;
            }
        });
        summary.freed = dp
            .free_events
            .drain_bounded(bound, |event| self.on_free(&event));
        summary.responses = dp
            .responses
            .drain_bounded(bound, |resp| self.on_response(&resp));

        self.totals.created += summary.created;
        self.totals.freed += summary.freed;
        self.totals.signals += summary.signals;
        self.totals.orphan_signals += summary.orphan_signals;
        self.totals.responses += summary.responses;
        self.totals.inbound += summary.inbound;
        summary
    }

    fn pump_uplink(&mut self, bound: usize) -> usize {
        let Some(uplink) = self.uplink.as_mut() else {
            return 0;
        };
        let inbound: Vec<Inbound> = std::iter::from_fn(|| uplink.recv()).take(bound).collect();
        for msg in &inbound {
            match *msg {
                Inbound::Command(req) => {
                    if !self.datapath.requests.push(req) {
                        debug!(command = req.command, "request channel full, dropping command");
                    }
                }
                Inbound::Control(ctrl) => {
                    self.apply(ctrl);
                }
            }
        }
        inbound.len()
    }

    fn forward<T: bytemuck::NoUninit>(&mut self, kind: FrameKind, record: &T) {
        if let Some(uplink) = self.uplink.as_mut() {
            uplink.send(kind, record);
        }
    }

    fn on_create(&mut self, event: &CreateConnEvent) {
        let flow = FlowInfo::from(event);
        info!(flow = %flow, "connection created");
        self.forward(FrameKind::CreateConn, event);
        // A key seen again before its free is a new flow at a reused socket
        // address; the free still on its way belongs to the old one.
        if self.flows.insert(event.flow_key, flow).is_some() {
            *self.stale_frees.entry(event.flow_key).or_insert(0) += 1;
        }

        if let Some(cwnd) = self.policy.cwnd_bytes {
            self.apply(ControlMessage::SetCwnd(event.flow_key, cwnd));
        }
        if let Some(rate) = self.policy.pacing_rate {
            self.apply(ControlMessage::SetRateAbs(event.flow_key, rate));
        }
    }

    fn on_signal(&mut self, signal: &Signal) -> bool {
        self.forward(FrameKind::Signal, signal);
        match self.flows.get_mut(&signal.flow_key) {
            Some(flow) => {
                flow.signals += 1;
                flow.last_signal = Some(*signal);
                debug!(
                    flow = signal.flow_key,
                    bytes_acked = signal.bytes_acked,
                    packets_acked = signal.packets_acked,
                    rtt_us = signal.rtt_sample_us,
                    rate_out = signal.rate_outgoing,
                    in_flight = signal.bytes_in_flight,
                    cwnd = signal.snd_cwnd,
                    pending = signal.bytes_pending,
                    "signal"
                );
                true
            }
            None => {
                trace!(flow = signal.flow_key, "signal for unknown flow");
                false
            }
        }
    }

    fn on_free(&mut self, event: &FreeConnEvent) {
        self.forward(FrameKind::FreeConn, event);
        if let Some(owed) = self.stale_frees.get_mut(&event.flow_key) {
            *owed -= 1;
            if *owed == 0 {
                self.stale_frees.remove(&event.flow_key);
            }
            debug!(flow = event.flow_key, "free for an earlier flow at a reused key");
            return;
        }
        match self.flows.remove(&event.flow_key) {
            Some(flow) => info!(flow = %flow, "connection freed"),
            None => debug!(flow = event.flow_key, "free for unknown flow"),
        }
    }

    fn on_response(&mut self, resp: &CommandResponse) {
        self.forward(FrameKind::CommandResponse, resp);
        match CommandType::try_from(resp.command) {
            Ok(CommandType::Timestamp) => {
                debug!(timestamp_us = resp.value, "datapath timestamp");
                self.last_timestamp = Some(resp.value);
            }
            Err(raw) => debug!(command = raw, "ignoring unknown response"),
        }
    }

    /// Writes into an existing row. Rows only come from admission, so a
    /// message for a flow the datapath never admitted (or already released)
    /// is ignored.
    pub fn apply(&self, msg: ControlMessage) -> bool {
        let applied = match msg {
            ControlMessage::SetCwnd(key, cwnd) => {
                self.datapath.connections.update(key, |s| s.cwnd = cwnd)
            }
            ControlMessage::SetRateAbs(key, rate) => {
                self.datapath.connections.update(key, |s| s.pacing_rate = rate)
            }
        };
        if !applied {
            debug!(?msg, "no connection for control message");
        }
        applied
    }

    pub fn query_timestamp(&self) -> bool {
        self.datapath
            .requests
            .push(CommandRequest::new(CommandType::Timestamp, 0))
    }

    pub fn flow(&self, key: u64) -> Option<&FlowInfo> {
        self.flows.get(&key)
    }

    pub fn flows(&self) -> impl Iterator<Item = &FlowInfo> {
        self.flows.values()
    }

    pub fn last_timestamp(&self) -> Option<u32> {
        self.last_timestamp
    }

    pub fn totals(&self) -> PollSummary {
        self.totals
    }

    pub fn connections_json(&self) -> serde_json::Value {
        let rows = self.datapath.connections.snapshot();
        connections_json(&rows, |key| self.flows.get(&key))
    }

    pub fn log_connections(&self) {
        for (key, state) in self.datapath.connections.snapshot() {
            match self.flows.get(&key) {
                Some(flow) => info!("{} ({} -> {})", ConnectionRow(key, &state), flow.src, flow.dst),
                None => info!("{}", ConnectionRow(key, &state)),
            }
        }
    }

    pub fn log_stats(&self) {
        info!(
            live = self.flows.len(),
            last_timestamp_us = ?self.last_timestamp,
            "datapath {}",
            self.datapath.stats()
        );
        if let Some(uplink) = &self.uplink {
            let stats = uplink.stats();
            info!(
                sent = stats.sent,
                send_dropped = stats.send_dropped,
                received = stats.received,
                malformed = stats.malformed,
                "agent socket"
            );
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AgentOptions {
    pub poll_interval: Duration,
    pub report_interval: Duration,
}

impl AgentOptions {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.poll_interval.is_zero(),
            "poll interval must be greater than zero"
        );
        ensure!(
            !self.report_interval.is_zero(),
            "report interval must be greater than zero"
        );
        Ok(())
    }
}

/// Polls the datapath until `running` is cleared, then drains once more
/// and hands the control plane back.
pub async fn run_agent(
    mut plane: ControlPlane,
    opts: AgentOptions,
    running: Arc<AtomicBool>,
) -> ControlPlane {
    let mut poller = time::interval(opts.poll_interval);
    let mut reporter = time::interval(opts.report_interval);
    // the first tick of an interval completes immediately
    reporter.tick().await;

    while running.load(Ordering::Relaxed) {
        tokio::select! {
            _ = poller.tick() => {
                plane.poll();
            }
            _ = reporter.tick() => {
                plane.query_timestamp();
                plane.log_stats();
            }
        }
    }

    plane.poll();
    plane
}
