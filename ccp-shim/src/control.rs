use ccp_shim_common::ConnectionState;

use crate::{
    datapath::{Datapath, DatapathStats},
    sock::TcpSock,
};

/// Looks the flow up and, if present, overwrites `snd_cwnd` and the pacing
/// rate. Returns whether anything was applied.
pub fn apply_control(dp: &Datapath, tp: &mut TcpSock) -> bool {
    match dp.connections.lookup(tp.flow_key()) {
        Some(state) => {
            apply_row(dp, &state, tp);
            true
        }
        None => false,
    }
}

/// `apply_control` for a caller that already holds the flow's row.
pub fn apply_row(dp: &Datapath, state: &ConnectionState, tp: &mut TcpSock) {
    apply_state(state, tp);
    DatapathStats::bump(&dp.stats.controls_applied);
}

pub fn apply_state(state: &ConnectionState, tp: &mut TcpSock) {
    if tp.mss_cache != 0 {
        // snd_cwnd is in packets; never hand the stack a zero window
        tp.snd_cwnd = (state.cwnd / tp.mss_cache).max(1);
    }
    if state.pacing_rate != 0 {
        tp.sk_pacing_rate = state.pacing_rate;
    }
}

/// Row inserted on admission: the flow's current window and pacing rate.
pub fn initial_state(tp: &TcpSock) -> ConnectionState {
    ConnectionState {
        cwnd: tp.cwnd_bytes(),
        pad: 0,
        pacing_rate: tp.sk_pacing_rate,
    }
}

pub fn fallback_ssthresh(tp: &TcpSock) -> u32 {
    (tp.snd_cwnd >> 1).max(2)
}

pub fn fallback_undo_cwnd(tp: &TcpSock) -> u32 {
    tp.snd_cwnd.max(tp.snd_ssthresh.saturating_mul(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::{DatapathConfig, tests::datapath};

    fn sock() -> TcpSock {
        TcpSock {
            sock_addr: 11,
            snd_cwnd: 10,
            snd_ssthresh: 8,
            mss_cache: 1000,
            sk_pacing_rate: 1_000_000,
            ..TcpSock::default()
        }
    }

    #[test]
    fn absent_flow_is_left_alone() {
        let dp = datapath(DatapathConfig::default());
        let mut tp = sock();
        assert!(!apply_control(&dp, &mut tp));
        assert_eq!(tp, sock());
        assert_eq!(dp.stats().controls_applied, 0);
    }

    #[test]
    fn present_flow_gets_window_in_packets_and_rate() {
        let dp = datapath(DatapathConfig::default());
        let mut tp = sock();
        dp.connections.admit(
            11,
            ConnectionState {
                cwnd: 25_500,
                pad: 0,
                pacing_rate: 3_000_000,
            },
        );
        assert!(apply_control(&dp, &mut tp));
        assert_eq!(tp.snd_cwnd, 25);
        assert_eq!(tp.sk_pacing_rate, 3_000_000);
    }

    #[test]
    fn zero_rate_keeps_host_pacing_and_tiny_window_clamps() {
        let mut tp = sock();
        apply_state(
            &ConnectionState {
                cwnd: 10,
                pad: 0,
                pacing_rate: 0,
            },
            &mut tp,
        );
        assert_eq!(tp.snd_cwnd, 1);
        assert_eq!(tp.sk_pacing_rate, 1_000_000);
    }

    #[test]
    fn initial_state_mirrors_the_socket() {
        let state = initial_state(&sock());
        assert_eq!(state.cwnd, 10_000);
        assert_eq!(state.pacing_rate, 1_000_000);
    }

    #[test]
    fn fallback_policy() {
        let mut tp = sock();
        assert_eq!(fallback_ssthresh(&tp), 5);
        assert_eq!(fallback_undo_cwnd(&tp), 16);

        tp.snd_cwnd = 3;
        assert_eq!(fallback_ssthresh(&tp), 2);
        tp.snd_cwnd = 40;
        assert_eq!(fallback_undo_cwnd(&tp), 40);
    }
}
