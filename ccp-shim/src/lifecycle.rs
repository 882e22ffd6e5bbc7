use tracing::trace;

use ccp_shim_common::{CreateConnEvent, FreeConnEvent};

use crate::{datapath::Datapath, sock::TcpSock};

pub fn create_event(tp: &TcpSock) -> CreateConnEvent {
    CreateConnEvent {
        flow_key: tp.flow_key(),
        init_cwnd: tp.cwnd_bytes(),
        mss: tp.mss_cache,
        src_ip: tp.src_ip,
        src_port: tp.src_port as u32,
        dst_ip: tp.dst_ip,
        dst_port: tp.dst_port as u32,
    }
}

// One create and one free per flow lifetime relies on admission being
// idempotent; nothing here deduplicates.
pub fn emit_create(dp: &Datapath, tp: &TcpSock) -> bool {
    let sent = dp.create_events.push(create_event(tp));
    if !sent {
        trace!(flow = tp.flow_key(), "create channel full, dropping event");
    }
    sent
}

pub fn emit_free(dp: &Datapath, flow_key: u64) -> bool {
    let sent = dp.free_events.push(FreeConnEvent { flow_key });
    if !sent {
        trace!(flow = flow_key, "free channel full, dropping event");
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::{DatapathConfig, tests::datapath};

    #[test]
    fn create_event_carries_window_in_bytes_and_four_tuple() {
        let tp = TcpSock {
            sock_addr: 0xffff_8880_0000_1000,
            src_ip: 0x0a00_0001,
            src_port: 5201,
            dst_ip: 0x0a00_0002,
            dst_port: 40123,
            snd_cwnd: 10,
            mss_cache: 1448,
            ..TcpSock::default()
        };
        let event = create_event(&tp);
        assert_eq!(event.flow_key, 0xffff_8880_0000_1000);
        assert_eq!(event.init_cwnd, 14_480);
        assert_eq!(event.mss, 1448);
        assert_eq!(event.src_port, 5201);
        assert_eq!(event.dst_ip, 0x0a00_0002);
    }

    #[test]
    fn full_lifecycle_channels_drop_silently() {
        let dp = datapath(DatapathConfig {
            channel_capacity: 1,
            ..DatapathConfig::default()
        });
        assert!(emit_free(&dp, 1));
        assert!(!emit_free(&dp, 2));
        assert_eq!(dp.free_events.pop().map(|e| e.flow_key), Some(1));
        assert!(dp.free_events.pop().is_none());
    }
}
