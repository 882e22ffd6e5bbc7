use std::net::{Ipv4Addr, SocketAddrV4};

use serde_json::{Map as JsonMap, Number as JsonNumber, Value};

use ccp_shim_common::{ConnectionState, CreateConnEvent, Signal};

/// What the agent knows about a live flow, built from its create event.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlowInfo {
    pub flow_key: u64,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub mss: u32,
    pub init_cwnd: u32,
    pub signals: u64,
    pub last_signal: Option<Signal>,
}

impl From<&CreateConnEvent> for FlowInfo {
    fn from(event: &CreateConnEvent) -> Self {
        Self {
            flow_key: event.flow_key,
            src: SocketAddrV4::new(Ipv4Addr::from(event.src_ip), event.src_port as u16),
            dst: SocketAddrV4::new(Ipv4Addr::from(event.dst_ip), event.dst_port as u16),
            mss: event.mss,
            init_cwnd: event.init_cwnd,
            signals: 0,
            last_signal: None,
        }
    }
}

impl std::fmt::Display for FlowInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:#x} {} -> {} mss:{} init_cwnd:{} signals:{}",
            self.flow_key, self.src, self.dst, self.mss, self.init_cwnd, self.signals
        )
    }
}

/// Display wrapper for one connection-table row.
pub struct ConnectionRow<'a>(pub u64, pub &'a ConnectionState);

impl std::fmt::Display for ConnectionRow<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:#x} cwnd: {} pacing_rate: {}",
            self.0, self.1.cwnd, self.1.pacing_rate
        )
    }
}

/// Renders connection-table rows as a JSON array of
/// `{flow, cwnd, pacing_rate, peer?}` objects. `peer` is filled in when
/// the agent has seen the flow's create event.
pub fn connections_json<'a, F>(rows: &[(u64, ConnectionState)], lookup: F) -> Value
where
    F: Fn(u64) -> Option<&'a FlowInfo>,
{
    let mut out = Vec::with_capacity(rows.len());
    for (key, state) in rows {
        let mut obj = JsonMap::new();
        obj.insert("flow".to_string(), Value::String(format!("{key:#x}")));
        obj.insert("cwnd".to_string(), Value::Number(JsonNumber::from(state.cwnd)));
        obj.insert(
            "pacing_rate".to_string(),
            Value::Number(JsonNumber::from(state.pacing_rate)),
        );
        if let Some(info) = lookup(*key) {
            obj.insert(
                "peer".to_string(),
                Value::String(format!("{} -> {}", info.src, info.dst)),
            );
            obj.insert(
                "signals".to_string(),
                Value::Number(JsonNumber::from(info.signals)),
            );
        }
        out.push(Value::Object(obj));
    }
    Value::Array(out)
}
