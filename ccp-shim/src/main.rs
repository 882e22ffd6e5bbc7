use std::path::PathBuf;
use std::process::exit;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tokio::{signal, time};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use ccp_shim::{
    CcpShim, Datapath, DatapathConfig,
    agent::{AgentOptions, ControlPlane, StaticPolicy, run_agent},
    harness::{HarnessOptions, HostHarness},
    uplink::{self, Uplink},
    wire,
};

#[derive(Parser)]
#[command(name = "ccp-shim")]
#[command(about = "Congestion-control datapath shim with a CCP agent front end", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive synthetic flows through the shim and report what the agent saw
    Simulate(SimulateCommand),
}

#[derive(Args)]
struct SimulateCommand {
    /// Number of flows to open
    #[arg(long, default_value_t = 8)]
    flows: usize,
    /// Ack rounds to run before closing every flow
    #[arg(long, default_value_t = 200)]
    ticks: u64,
    /// Milliseconds between ack rounds
    #[arg(long, default_value_t = 10)]
    tick_ms: u64,
    /// Threads stepping flows concurrently each round
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Connection table capacity
    #[arg(long, default_value_t = wire::MAX_FLOWS)]
    max_flows: usize,
    /// Records per channel before producers start dropping
    #[arg(long, default_value_t = wire::CHANNEL_CAPACITY)]
    channel_capacity: usize,
    /// Commands consumed per pkts_acked call
    #[arg(long, default_value_t = wire::COMMAND_DRAIN_BOUND)]
    drain_bound: usize,
    /// Packet size used for rate estimates (bytes)
    #[arg(long, default_value_t = wire::MTU)]
    mtu: u32,
    /// Segment size of the synthetic flows (bytes)
    #[arg(long, default_value_t = 1448)]
    mss: u32,
    /// Window the agent assigns to every new flow (bytes)
    #[arg(long, value_name = "BYTES")]
    cwnd_bytes: Option<u32>,
    /// Pacing rate the agent assigns to every new flow (bytes/s)
    #[arg(long, value_name = "BYTES_PER_SEC")]
    pacing_rate: Option<u64>,
    /// Milliseconds between agent polls of the datapath channels
    #[arg(long, default_value_t = 5)]
    poll_ms: u64,
    /// Seconds between stats lines
    #[arg(long, default_value_t = 1)]
    report_interval_secs: u64,
    /// Print the final connection table as JSON on stdout
    #[arg(long)]
    json: bool,
    /// Mirror records to an external agent listening on this socket
    #[arg(long, value_name = "PATH", num_args = 0..=1, default_missing_value = uplink::AGENT_SOCKET)]
    agent_socket: Option<PathBuf>,
    /// Socket the datapath binds for agent traffic
    #[arg(long, value_name = "PATH", default_value = uplink::DATAPATH_SOCKET)]
    datapath_socket: PathBuf,
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("ccp-shim error: {err:?}");
        exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Simulate(cmd)) => simulate(cmd).await?,
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

async fn simulate(cmd: SimulateCommand) -> Result<()> {
    let config = DatapathConfig {
        max_flows: cmd.max_flows,
        channel_capacity: cmd.channel_capacity,
        command_drain_bound: cmd.drain_bound,
        mtu: cmd.mtu,
    };
    let datapath = Arc::new(Datapath::new(config).context("invalid datapath configuration")?);

    let agent_opts = AgentOptions {
        poll_interval: Duration::from_millis(cmd.poll_ms),
        report_interval: Duration::from_secs(cmd.report_interval_secs.max(1)),
    };
    agent_opts.validate()?;
    let tick = Duration::from_millis(cmd.tick_ms.max(1));
    let harness_opts = HarnessOptions {
        mss: cmd.mss,
        tick_us: tick.as_micros().min(u32::MAX as u128) as u32,
        ..HarnessOptions::default()
    };
    let mut harness = HostHarness::new(CcpShim, datapath.clone(), harness_opts)?;

    let policy = StaticPolicy {
        cwnd_bytes: cmd.cwnd_bytes,
        pacing_rate: cmd.pacing_rate,
    };
    let mut plane = ControlPlane::new(datapath.clone(), policy);
    if let Some(agent_socket) = &cmd.agent_socket {
        let link = Uplink::bind(&cmd.datapath_socket, agent_socket)
            .context("failed to set up agent socket")?;
        info!(
            local = %cmd.datapath_socket.display(),
            agent = %agent_socket.display(),
            "forwarding to external agent"
        );
        plane = plane.with_uplink(link);
    }
    let running = Arc::new(AtomicBool::new(true));
    let agent = tokio::spawn(run_agent(plane, agent_opts, running.clone()));

    for _ in 0..cmd.flows {
        harness.open_flow();
    }
    info!(
        flows = cmd.flows,
        admitted = datapath.connections.len(),
        "opened flows"
    );

    let workers = cmd.workers;
    let ticks = cmd.ticks;
    let stepping = running.clone();
    let mut stepper = tokio::spawn(async move {
        let mut ticker = time::interval(tick);
        for _ in 0..ticks {
            ticker.tick().await;
            if !stepping.load(Ordering::Relaxed) {
                break;
            }
            harness.tick_parallel(workers);
        }
        harness
    });

    let mut harness = tokio::select! {
        joined = &mut stepper => joined.map_err(|err| anyhow!("harness task panicked: {err}"))?,
        res = signal::ctrl_c() => {
            res.context("failed to wait for ctrl-c")?;
            info!("received shutdown signal, draining...");
            running.store(false, Ordering::Relaxed);
            stepper
                .await
                .map_err(|err| anyhow!("harness task panicked: {err}"))?
        }
    };
    info!(ticks = harness.ticks(), "stepping finished");

    running.store(false, Ordering::Relaxed);
    let mut plane = agent
        .await
        .map_err(|err| anyhow!("agent task panicked: {err}"))?;

    if cmd.json {
        println!("{}", plane.connections_json());
    } else {
        plane.log_connections();
    }

    harness.close_all();
    plane.poll();
    plane.log_stats();
    let totals = plane.totals();
    info!(
        created = totals.created,
        freed = totals.freed,
        signals = totals.signals,
        orphan_signals = totals.orphan_signals,
        responses = totals.responses,
        "agent totals"
    );
    Ok(())
}
