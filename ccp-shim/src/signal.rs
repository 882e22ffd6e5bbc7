use tracing::trace;

use ccp_shim_common::{S_TO_US, Signal};

use crate::{
    datapath::{Datapath, DatapathStats},
    sock::{RateSample, TcpSock},
};

/// Snapshot of the counters seen at the previous signal computation.
///
/// Lives in the socket's private congestion area, so only the owning flow
/// ever reads or writes it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FlowPrivate {
    pub last_bytes_acked: u32,
    pub last_sacked_out: u32,
    pub last_snd_una: u32,
    // Rates are only recomputed when the sample carries both intervals;
    // otherwise the previous pair is reported again.
    pub last_rate_outgoing: u64,
    pub last_rate_incoming: u64,
}

impl FlowPrivate {
    pub fn from_sock(tp: &TcpSock) -> Self {
        Self {
            last_bytes_acked: tp.bytes_acked as u32,
            last_sacked_out: tp.sacked_out,
            last_snd_una: tp.snd_una,
            ..Self::default()
        }
    }
}

/// Builds the signal for this invocation and advances the snapshot.
pub fn compute_signal(tp: &TcpSock, ca: &mut FlowPrivate, rs: &RateSample, mtu: u32) -> Signal {
    let mss = tp.mss_cache;
    let bytes_acked = (tp.bytes_acked as u32).wrapping_sub(ca.last_bytes_acked);
    let packets_misordered = tp.sacked_out.saturating_sub(ca.last_sacked_out);
    let packets_acked = rs.acked_sacked.saturating_sub(packets_misordered);

    if rs.snd_interval_us != 0 && rs.rcv_interval_us != 0 {
        ca.last_rate_outgoing = delivery_rate(rs.delivered, rs.snd_interval_us, mtu);
        ca.last_rate_incoming = delivery_rate(rs.delivered, rs.rcv_interval_us, mtu);
    }

    let packets_in_flight = tp.packets_in_flight();
    let signal = Signal {
        flow_key: tp.flow_key(),
        bytes_acked,
        packets_acked,
        bytes_misordered: packets_misordered.wrapping_mul(mss),
        packets_misordered,
        lost_pkts_sample: rs.losses,
        pad0: 0,
        rtt_sample_us: rs.rtt_us.max(0) as u64,
        rate_outgoing: ca.last_rate_outgoing,
        rate_incoming: ca.last_rate_incoming,
        bytes_in_flight: packets_in_flight.wrapping_mul(mss),
        packets_in_flight,
        snd_cwnd: tp.cwnd_bytes(),
        bytes_pending: bytes_pending(tp.snd_una, tp.write_seq),
    };

    ca.last_bytes_acked = tp.bytes_acked as u32;
    ca.last_sacked_out = tp.sacked_out;
    ca.last_snd_una = tp.snd_una;
    signal
}

/// Computes the signal and publishes it. The snapshot advances even when
/// the channel is full.
pub fn emit_signal(dp: &Datapath, tp: &TcpSock, ca: &mut FlowPrivate, rs: &RateSample) -> bool {
    let signal = compute_signal(tp, ca, rs, dp.config.mtu);
    if dp.signals.push(signal) {
        DatapathStats::bump(&dp.stats.signals_emitted);
        true
    } else {
        trace!(flow = tp.flow_key(), "signal channel full, dropping signal");
        false
    }
}

/// Bytes/s from a packet count over an interval, `delivered * mtu * 1e6 /
/// interval_us`, split into quotient and remainder so the scale-up does not
/// overflow.
pub fn delivery_rate(delivered: u32, interval_us: u32, mtu: u32) -> u64 {
    if interval_us == 0 {
        return 0;
    }
    let bytes = delivered as u64 * mtu as u64;
    let interval = interval_us as u64;
    let quotient = bytes / interval;
    let remainder = bytes % interval;
    quotient
        .saturating_mul(S_TO_US)
        .saturating_add(remainder * S_TO_US / interval)
}

/// Unsent plus unacked bytes, `write_seq - snd_una`, measured forward
/// across a sequence wrap.
pub fn bytes_pending(snd_una: u32, write_seq: u32) -> u32 {
    if snd_una > write_seq {
        u32::MAX - (snd_una - write_seq)
    } else {
        write_seq - snd_una
    }
}
