//! Congestion-control datapath shim.
//!
//! The shim sits on the per-ack path of a TCP stack and does no congestion
//! control of its own. It reports measurements to an external agent, tells
//! the agent when flows come and go, and applies whatever window and rate
//! the agent has stored for a flow. Everything the hooks touch is bounded:
//! channels drop on full, the connection table has a fixed capacity, and
//! the command drain consumes a fixed number of requests per call.

pub mod agent;
pub mod channel;
pub mod command;
pub mod control;
pub mod datapath;
pub mod harness;
pub mod lifecycle;
pub mod model;
pub mod shim;
pub mod signal;
pub mod sock;
pub mod table;
pub mod uplink;

pub use ccp_shim_common as wire;
pub use datapath::{Datapath, DatapathConfig};
pub use shim::{CcpShim, CongestionOps};
pub use sock::{Sock, TcpSock};
