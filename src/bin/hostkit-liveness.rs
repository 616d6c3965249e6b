//! Control-channel liveness probe.
//!
//! Pings `agent.<id>` through a broker and exits successfully once the agent
//! answers `pong`. Every attempt reconnects, so a broker or agent that comes
//! up during the observation window is still detected.

use std::io::Write as _;
use std::time::Duration;

use clap::Parser;
use hostkit::control::{LivenessCheck, LivenessTiming};
use hostkit::logging;

#[derive(Debug, Parser)]
#[command(
    name = "hostkit-liveness",
    about = "Ping a hostkit agent over the control channel and wait for pong"
)]
struct Cli {
    /// Broker address, as `host:port`.
    #[arg(long, env = "HOSTKIT_MBUS_ADDRESS")]
    address: String,
    /// Agent identifier; requests are published on `agent.<id>`.
    #[arg(long, env = "HOSTKIT_AGENT_ID")]
    agent_id: String,
    /// Overall observation window in seconds.
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    window_secs: u64,
    /// Delay between attempts in milliseconds.
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    interval_ms: u64,
    /// Wait for each reply in milliseconds.
    #[arg(long, default_value_t = 5000, value_parser = clap::value_parser!(u64).range(1..))]
    reply_timeout_ms: u64,
}

impl Cli {
    const fn timing(&self) -> LivenessTiming {
        LivenessTiming {
            window: Duration::from_secs(self.window_secs),
            interval: Duration::from_millis(self.interval_ms),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();
    let _log_guard = logging::init();

    let report = LivenessCheck::new(cli.agent_id.as_str(), cli.timing())
        .run_tcp(&cli.address)
        .await
        .map_err(|err| err.to_string())?;
    writeln!(
        std::io::stdout(),
        "pong from agent.{} after {} attempt(s) in {}ms",
        cli.agent_id,
        report.attempts,
        report.elapsed.as_millis()
    )
    .map_err(|err| err.to_string())?;
    Ok(())
}
