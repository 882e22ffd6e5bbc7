use std::net::{Ipv4Addr, SocketAddrV4};

/// The subset of `tcp_sock` the shim consumes.
///
/// Counters follow kernel semantics: sequence numbers and packet counts are
/// unsigned and may wrap.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TcpSock {
    /// Socket address; doubles as the flow key.
    pub sock_addr: u64,
    pub src_ip: u32,
    pub src_port: u16,
    pub dst_ip: u32,
    pub dst_port: u16,
    /// Congestion window, in packets.
    pub snd_cwnd: u32,
    pub snd_ssthresh: u32,
    pub mss_cache: u32,
    pub bytes_acked: u64,
    pub sacked_out: u32,
    pub lost_out: u32,
    pub packets_out: u32,
    pub retrans_out: u32,
    pub snd_una: u32,
    pub write_seq: u32,
    /// Pacing rate in bytes/s, 0 when the stack does not pace.
    pub sk_pacing_rate: u64,
}

impl TcpSock {
    pub fn flow_key(&self) -> u64 {
        self.sock_addr
    }

    pub fn src(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.src_ip), self.src_port)
    }

    pub fn dst(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.dst_ip), self.dst_port)
    }

    pub fn left_out(&self) -> u32 {
        self.sacked_out.wrapping_add(self.lost_out)
    }

    pub fn packets_in_flight(&self) -> u32 {
        self.packets_out
            .wrapping_sub(self.left_out())
            .wrapping_add(self.retrans_out)
    }

    /// Current window in bytes.
    pub fn cwnd_bytes(&self) -> u32 {
        self.snd_cwnd.wrapping_mul(self.mss_cache)
    }
}

/// A socket plus the congestion module's private per-flow area.
#[derive(Clone, Debug, Default)]
pub struct Sock<P> {
    pub tcp: TcpSock,
    pub ca: P,
}

impl<P: Default> Sock<P> {
    pub fn new(tcp: TcpSock) -> Self {
        Self {
            tcp,
            ca: P::default(),
        }
    }
}

impl<P> Sock<P> {
    pub fn flow_key(&self) -> u64 {
        self.tcp.flow_key()
    }
}

/// Delivery-rate sample handed to `cong_control`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RateSample {
    /// Packets delivered over the sampling interval.
    pub delivered: u32,
    pub snd_interval_us: u32,
    pub rcv_interval_us: u32,
    pub losses: u32,
    /// Packets newly acked or sacked by this ack.
    pub acked_sacked: u32,
    /// RTT of the last acked packet, negative when unavailable.
    pub rtt_us: i64,
}

/// Per-ack sample handed to `pkts_acked`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AckSample {
    pub pkts_acked: u32,
    pub rtt_us: i32,
    pub in_flight: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CaEvent {
    TxStart,
    CwndRestart,
    CompleteCwr,
    Loss,
    EcnNoCe,
    EcnIsCe,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CaState {
    Open,
    Disorder,
    Cwr,
    Recovery,
    Loss,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_excludes_left_out_and_adds_retransmits() {
        let tp = TcpSock {
            packets_out: 20,
            sacked_out: 3,
            lost_out: 2,
            retrans_out: 1,
            ..TcpSock::default()
        };
        assert_eq!(tp.left_out(), 5);
        assert_eq!(tp.packets_in_flight(), 16);
    }

    #[test]
    fn addresses_render_in_dotted_form() {
        let tp = TcpSock {
            src_ip: u32::from(Ipv4Addr::new(10, 0, 0, 1)),
            src_port: 40000,
            dst_ip: u32::from(Ipv4Addr::new(10, 0, 0, 2)),
            dst_port: 443,
            ..TcpSock::default()
        };
        assert_eq!(tp.src().to_string(), "10.0.0.1:40000");
        assert_eq!(tp.dst().to_string(), "10.0.0.2:443");
    }
}
