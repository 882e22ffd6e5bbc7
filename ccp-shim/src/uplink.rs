use std::{
    fs, io,
    os::unix::net::UnixDatagram,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail, ensure};
use bytemuck::{NoUninit, Pod};
use tracing::{debug, trace};

use ccp_shim_common::{
    CommandRequest, ControlRecord, FRAME_HEADER_LEN, FrameHeader, FrameKind,
};

use crate::agent::ControlMessage;

pub const AGENT_SOCKET: &str = "/tmp/ccp/portus";
pub const DATAPATH_SOCKET: &str = "/tmp/ccp/ebpfccp";

const RECV_BUF_LEN: usize = 256;

/// Something an out-of-process agent asked for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Inbound {
    Command(CommandRequest),
    Control(ControlMessage),
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UplinkStats {
    pub sent: u64,
    pub send_dropped: u64,
    pub received: u64,
    pub malformed: u64,
}

/// Datagram link to an agent running in another process.
///
/// The socket is non-blocking on both sides: a send the kernel cannot take
/// right now is dropped and counted, the same way the in-process channels
/// drop on full.
#[derive(Debug)]
pub struct Uplink {
    socket: UnixDatagram,
    peer: Option<PathBuf>,
    stats: UplinkStats,
}

impl Uplink {
    /// Binds `local` (replacing a stale socket file) and sends to `peer`.
    pub fn bind(local: &Path, peer: &Path) -> Result<Self> {
        if let Some(dir) = local.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        if local.exists() {
            fs::remove_file(local)
                .with_context(|| format!("failed to remove stale socket {}", local.display()))?;
        }
        let socket = UnixDatagram::bind(local)
            .with_context(|| format!("failed to bind {}", local.display()))?;
        let mut uplink = Self::from_socket(socket)?;
        uplink.peer = Some(peer.to_path_buf());
        Ok(uplink)
    }

    /// Wraps an already connected socket, e.g. one end of a pair.
    pub fn from_socket(socket: UnixDatagram) -> Result<Self> {
        socket
            .set_nonblocking(true)
            .context("failed to make agent socket non-blocking")?;
        Ok(Self {
            socket,
            peer: None,
            stats: UplinkStats::default(),
        })
    }

    pub fn send<T: NoUninit>(&mut self, kind: FrameKind, record: &T) -> bool {
        let frame = encode_frame(kind, record);
        let res = match &self.peer {
            Some(peer) => self.socket.send_to(&frame, peer),
            None => self.socket.send(&frame),
        };
        match res {
            Ok(_) => {
                self.stats.sent += 1;
                true
            }
            Err(err) => {
                self.stats.send_dropped += 1;
                trace!(?kind, error = %err, "dropping frame for agent");
                false
            }
        }
    }

    /// Next well-formed message from the agent, or `None` once the socket
    /// has nothing queued. Malformed datagrams are skipped.
    pub fn recv(&mut self) -> Option<Inbound> {
        let mut buf = [0u8; RECV_BUF_LEN];
        loop {
            let len = match self.socket.recv(&mut buf) {
                Ok(len) => len,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return None,
                Err(err) => {
                    debug!(error = %err, "agent socket receive failed");
                    return None;
                }
            };
            match decode_inbound(&buf[..len]) {
                Ok(msg) => {
                    self.stats.received += 1;
                    return Some(msg);
                }
                Err(err) => {
                    self.stats.malformed += 1;
                    debug!(len, error = %err, "dropping malformed datagram from agent");
                }
            }
        }
    }

    pub fn stats(&self) -> UplinkStats {
        self.stats
    }
}

pub fn encode_frame<T: NoUninit>(kind: FrameKind, record: &T) -> Vec<u8> {
    let body = bytemuck::bytes_of(record);
    let header = FrameHeader {
        kind: kind.as_raw(),
        len: body.len() as u32,
    };
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(bytemuck::bytes_of(&header));
    frame.extend_from_slice(body);
    frame
}

/// Splits a datagram into its kind and record bytes, checking the header
/// against the datagram length and the kind's record size.
pub fn decode_frame(buf: &[u8]) -> Result<(FrameKind, &[u8])> {
    ensure!(buf.len() >= FRAME_HEADER_LEN, "short datagram: {} bytes", buf.len());
    let (head, body) = buf.split_at(FRAME_HEADER_LEN);
    let header: FrameHeader = bytemuck::try_pod_read_unaligned(head)
        .map_err(|err| anyhow::anyhow!("bad frame header: {err:?}"))?;
    let kind = match FrameKind::try_from(header.kind) {
        Ok(kind) => kind,
        Err(raw) => bail!("unknown frame kind {raw}"),
    };
    ensure!(
        header.len as usize == body.len() && body.len() == kind.record_len(),
        "{kind:?} frame carries {} bytes, header says {}",
        body.len(),
        header.len
    );
    Ok((kind, body))
}

pub fn decode_record<T: Pod>(body: &[u8]) -> Result<T> {
    bytemuck::try_pod_read_unaligned(body).map_err(|err| anyhow::anyhow!("bad record: {err:?}"))
}

fn decode_inbound(buf: &[u8]) -> Result<Inbound> {
    let (kind, body) = decode_frame(buf)?;
    match kind {
        FrameKind::CommandRequest => Ok(Inbound::Command(decode_record(body)?)),
        FrameKind::SetCwnd => {
            let rec: ControlRecord = decode_record(body)?;
            let cwnd = u32::try_from(rec.value)
                .with_context(|| format!("window {} does not fit 32 bits", rec.value))?;
            Ok(Inbound::Control(ControlMessage::SetCwnd(rec.flow_key, cwnd)))
        }
        FrameKind::SetRateAbs => {
            let rec: ControlRecord = decode_record(body)?;
            Ok(Inbound::Control(ControlMessage::SetRateAbs(rec.flow_key, rec.value)))
        }
        other => bail!("{other:?} frames only travel to the agent"),
    }
}
