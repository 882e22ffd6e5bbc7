use tracing::{debug, trace};

use crate::{
    command,
    control,
    datapath::{Datapath, DatapathStats},
    lifecycle,
    signal::{self, FlowPrivate},
    sock::{AckSample, CaEvent, CaState, RateSample, Sock},
    table::Admission,
};

/// Callbacks a host TCP stack invokes on a congestion-control module.
///
/// Every hook runs to completion without blocking. `Data` is the module's
/// private per-flow area, stored in the socket.
pub trait CongestionOps {
    type Data: Default;

    const NAME: &'static str;

    fn init(&self, dp: &Datapath, sk: &mut Sock<Self::Data>);

    fn cwnd_event(&self, _dp: &Datapath, _sk: &mut Sock<Self::Data>, _event: CaEvent) {}

    fn cong_control(&self, dp: &Datapath, sk: &mut Sock<Self::Data>, rs: &RateSample);

    fn cong_avoid(&self, dp: &Datapath, sk: &mut Sock<Self::Data>, ack: u32, acked: u32);

    fn ssthresh(&self, dp: &Datapath, sk: &mut Sock<Self::Data>) -> u32;

    fn set_state(&self, _dp: &Datapath, _sk: &mut Sock<Self::Data>, _state: CaState) {}

    fn pkts_acked(&self, dp: &Datapath, sk: &mut Sock<Self::Data>, sample: &AckSample);

    fn undo_cwnd(&self, dp: &Datapath, sk: &mut Sock<Self::Data>) -> u32;

    fn release(&self, dp: &Datapath, sk: &mut Sock<Self::Data>);
}

/// Forwards measurements to the agent and applies its decisions.
///
/// Flow lifecycle: `init` admits the flow (row + create event), each
/// `cong_control` reports a signal and applies control, `pkts_acked`
/// drains commands, `release` removes the row and reports the free. A flow
/// turned away at capacity still gets snapshots but no signals and no
/// control; the host's own behaviour carries it.
#[derive(Clone, Copy, Debug, Default)]
pub struct CcpShim;

impl CongestionOps for CcpShim {
    type Data = FlowPrivate;

    const NAME: &'static str = "ccp_shim";

    fn init(&self, dp: &Datapath, sk: &mut Sock<FlowPrivate>) {
        sk.ca = FlowPrivate::from_sock(&sk.tcp);
        let key = sk.flow_key();
        match dp.connections.admit(key, control::initial_state(&sk.tcp)) {
            Admission::Inserted => {
                DatapathStats::bump(&dp.stats.admitted);
                lifecycle::emit_create(dp, &sk.tcp);
            }
            Admission::AlreadyPresent => {
                trace!(flow = key, "flow already admitted");
            }
            Admission::AtCapacity => {
                DatapathStats::bump(&dp.stats.rejected_at_capacity);
                debug!(
                    flow = key,
                    max_flows = dp.connections.max_flows(),
                    "connection table full, flow stays on host policy"
                );
            }
        }
    }

    fn cong_control(&self, dp: &Datapath, sk: &mut Sock<FlowPrivate>, rs: &RateSample) {
        let Sock { tcp, ca } = sk;
        match dp.connections.lookup(tcp.flow_key()) {
            Some(state) => {
                signal::emit_signal(dp, tcp, ca, rs);
                control::apply_row(dp, &state, tcp);
            }
            None => {
                signal::compute_signal(tcp, ca, rs, dp.config.mtu);
            }
        }
    }

    fn cong_avoid(&self, dp: &Datapath, sk: &mut Sock<FlowPrivate>, _ack: u32, _acked: u32) {
        control::apply_control(dp, &mut sk.tcp);
    }

    fn ssthresh(&self, _dp: &Datapath, sk: &mut Sock<FlowPrivate>) -> u32 {
        control::fallback_ssthresh(&sk.tcp)
    }

    fn pkts_acked(&self, dp: &Datapath, _sk: &mut Sock<FlowPrivate>, _sample: &AckSample) {
        command::drain_commands(dp);
    }

    fn undo_cwnd(&self, _dp: &Datapath, sk: &mut Sock<FlowPrivate>) -> u32 {
        control::fallback_undo_cwnd(&sk.tcp)
    }

    fn release(&self, dp: &Datapath, sk: &mut Sock<FlowPrivate>) {
        let key = sk.flow_key();
        if dp.connections.remove(key) {
            DatapathStats::bump(&dp.stats.released);
            lifecycle::emit_free(dp, key);
        }
    }
}
