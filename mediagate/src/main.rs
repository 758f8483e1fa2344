mod http;
mod server;

use anyhow::Result;
use clap::Parser;
use mediagate_core::{config::Config, logging};
use tracing::info;

use server::GatewayServer;

#[derive(Parser, Debug)]
#[command(name = "mediagate")]
#[command(about = "Media gateway: RTSP/RTMP/RTP/GB28181 in, RTSP/RTMP/HLS/HTTP/WebRTC out, with recording", long_about = None)]
struct Args {
    /// Configuration file (any format the `config` crate reads)
    #[arg(short, long, env = "MEDIAGATE_CONFIG")]
    config: Option<String>,

    /// Overrides `logging.level`
    #[arg(long, env = "MEDIAGATE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration (fail fast on misconfigurations)
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        logging::parse_log_level(&level)?;
        config.logging.level = level;
    }
    if args.check_config {
        println!("Configuration OK");
        return Ok(());
    }

    // 2. Initialize logging; the guard flushes the log file on exit
    let _log_guard = logging::init_logging(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "mediagate starting...");
    info!(
        http = %config.http_address(),
        rtmp = %config.rtmp_address(),
        rtsp = %config.rtsp_address(),
        recording_root = %config.recording.root,
        "Configuration loaded"
    );

    // 3. Build the core and serve until a shutdown signal
    GatewayServer::new(config).await?.start().await
}
