#![no_std]

// Wire records exchanged between the datapath shim and the CCP agent.
// Keep this crate `no_std` and every record `#[repr(C)]` with explicit
// padding: the agent reads these byte-for-byte.

use bytemuck::{Pod, Zeroable};

/// Upper bound on concurrently admitted flows.
pub const MAX_FLOWS: usize = 1024;
/// Records per channel (signals, lifecycle events, commands).
pub const CHANNEL_CAPACITY: usize = 1024;
/// Commands consumed per `pkts_acked` invocation.
pub const COMMAND_DRAIN_BOUND: usize = 16;
/// Packet size used to turn delivered packet counts into byte rates.
pub const MTU: u32 = 1500;
pub const S_TO_US: u64 = 1_000_000;

/// Control state the agent maintains for one flow.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct ConnectionState {
    /// Congestion window in bytes; the host stack counts packets, so the
    /// applier divides by mss.
    pub cwnd: u32,
    pub pad: u32,
    /// Pacing rate in bytes per second, 0 when the agent never set one.
    pub pacing_rate: u64,
}

/// Per control-invocation measurement record.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct Signal {
    pub flow_key: u64,
    /// Newly acked, in-order bytes.
    pub bytes_acked: u32,
    /// Newly acked, in-order packets.
    pub packets_acked: u32,
    /// Out-of-order bytes.
    pub bytes_misordered: u32,
    /// Out-of-order packets.
    pub packets_misordered: u32,
    /// Estimate of the number of packets lost.
    pub lost_pkts_sample: u32,
    pub pad0: u32,
    /// Recent round-trip time sample.
    pub rtt_sample_us: u64,
    /// Sending rate sample, bytes/s.
    pub rate_outgoing: u64,
    /// Receiving rate sample, bytes/s.
    pub rate_incoming: u64,
    pub bytes_in_flight: u32,
    pub packets_in_flight: u32,
    /// Current congestion window, in bytes.
    pub snd_cwnd: u32,
    /// Data queued but not yet acked. An absolute value, not a delta.
    pub bytes_pending: u32,
}

/// Emitted once per admitted flow.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct CreateConnEvent {
    pub flow_key: u64,
    pub init_cwnd: u32,
    pub mss: u32,
    pub src_ip: u32,
    pub src_port: u32,
    pub dst_ip: u32,
    pub dst_port: u32,
}

/// Emitted once per released flow.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct FreeConnEvent {
    pub flow_key: u64,
}

/// Agent to datapath request.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct CommandRequest {
    pub command: u32,
    pub value: u32,
}

/// Datapath to agent response.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct CommandResponse {
    pub command: u32,
    pub value: u32,
}

/// Known command types. Raw values outside this set are dropped by the
/// datapath without a response.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CommandType {
    /// Ask the datapath for its clock, in microseconds (low 32 bits).
    Timestamp = 1,
}

impl CommandType {
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for CommandType {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            1 => Ok(CommandType::Timestamp),
            other => Err(other),
        }
    }
}

impl CommandRequest {
    pub fn new(command: CommandType, value: u32) -> Self {
        Self {
            command: command.as_raw(),
            value,
        }
    }
}

/// Window or rate update sent by an out-of-process agent.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct ControlRecord {
    pub flow_key: u64,
    /// Bytes for `SetCwnd` (must fit in 32 bits), bytes/s for `SetRateAbs`.
    pub value: u64,
}

/// Prefix of every datagram on the agent socket. `len` is the size of the
/// record that follows.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct FrameHeader {
    pub kind: u32,
    pub len: u32,
}

pub const FRAME_HEADER_LEN: usize = core::mem::size_of::<FrameHeader>();

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FrameKind {
    Signal = 1,
    CreateConn = 2,
    FreeConn = 3,
    CommandResponse = 4,
    CommandRequest = 5,
    SetCwnd = 6,
    SetRateAbs = 7,
}

impl FrameKind {
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Size of the record a frame of this kind carries.
    pub fn record_len(self) -> usize {
        match self {
            FrameKind::Signal => core::mem::size_of::<Signal>(),
            FrameKind::CreateConn => core::mem::size_of::<CreateConnEvent>(),
            FrameKind::FreeConn => core::mem::size_of::<FreeConnEvent>(),
            FrameKind::CommandResponse => core::mem::size_of::<CommandResponse>(),
            FrameKind::CommandRequest => core::mem::size_of::<CommandRequest>(),
            FrameKind::SetCwnd | FrameKind::SetRateAbs => core::mem::size_of::<ControlRecord>(),
        }
    }
}

impl TryFrom<u32> for FrameKind {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            1 => Ok(FrameKind::Signal),
            2 => Ok(FrameKind::CreateConn),
            3 => Ok(FrameKind::FreeConn),
            4 => Ok(FrameKind::CommandResponse),
            5 => Ok(FrameKind::CommandRequest),
            6 => Ok(FrameKind::SetCwnd),
            7 => Ok(FrameKind::SetRateAbs),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{align_of, size_of};

    #[test]
    fn record_layouts_are_stable() {
        assert_eq!(size_of::<ConnectionState>(), 16);
        assert_eq!(size_of::<Signal>(), 72);
        assert_eq!(align_of::<Signal>(), 8);
        assert_eq!(size_of::<CreateConnEvent>(), 32);
        assert_eq!(size_of::<FreeConnEvent>(), 8);
        assert_eq!(size_of::<CommandRequest>(), 8);
        assert_eq!(size_of::<CommandResponse>(), 8);
        assert_eq!(size_of::<ControlRecord>(), 16);
        assert_eq!(FRAME_HEADER_LEN, 8);
    }

    #[test]
    fn frame_kinds_round_trip_and_know_their_record_size() {
        for raw in 1..=7 {
            let kind = FrameKind::try_from(raw).unwrap();
            assert_eq!(kind.as_raw(), raw);
        }
        assert_eq!(FrameKind::try_from(0), Err(0));
        assert_eq!(FrameKind::Signal.record_len(), 72);
        assert_eq!(FrameKind::SetRateAbs.record_len(), 16);
    }

    #[test]
    fn signal_fields_sit_at_fixed_offsets() {
        let signal = Signal {
            flow_key: 0x0102_0304_0506_0708,
            rtt_sample_us: 77,
            bytes_pending: 0xAABB_CCDD,
            ..Signal::default()
        };
        let bytes = bytemuck::bytes_of(&signal);
        assert_eq!(&bytes[0..8], &0x0102_0304_0506_0708u64.to_ne_bytes());
        assert_eq!(&bytes[32..40], &77u64.to_ne_bytes());
        assert_eq!(&bytes[68..72], &0xAABB_CCDDu32.to_ne_bytes());
    }

    #[test]
    fn command_type_rejects_unknown_raw_values() {
        assert_eq!(CommandType::try_from(1), Ok(CommandType::Timestamp));
        assert_eq!(CommandType::try_from(0), Err(0));
        assert_eq!(CommandType::try_from(42), Err(42));
    }

    #[test]
    fn request_round_trips_through_bytes() {
        let req = CommandRequest::new(CommandType::Timestamp, 9);
        let decoded: CommandRequest = *bytemuck::from_bytes(bytemuck::bytes_of(&req));
        assert_eq!(decoded, req);
    }
}
