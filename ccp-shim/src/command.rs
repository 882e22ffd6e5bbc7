use tracing::trace;

use ccp_shim_common::{CommandRequest, CommandResponse, CommandType};

use crate::datapath::{Datapath, DatapathStats};

/// Consumes up to `command_drain_bound` pending requests and answers the
/// ones it understands. Returns how many requests were consumed.
pub fn drain_commands(dp: &Datapath) -> usize {
    dp.requests
        .drain_bounded(dp.config.command_drain_bound, |req| handle_command(dp, req))
}

fn handle_command(dp: &Datapath, req: CommandRequest) {
    let response = match CommandType::try_from(req.command) {
        Ok(CommandType::Timestamp) => CommandResponse {
            command: CommandType::Timestamp.as_raw(),
            value: dp.now_us() as u32,
        },
        Err(raw) => {
            DatapathStats::bump(&dp.stats.commands_unknown);
            trace!(command = raw, "dropping unknown command");
            return;
        }
    };
    DatapathStats::bump(&dp.stats.commands_handled);
    if !dp.responses.push(response) {
        trace!(command = req.command, "response channel full, dropping response");
    }
}
