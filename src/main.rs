use std::path::PathBuf;

use structopt::StructOpt;
use tracing::{error, info, trace};

#[macro_use]
extern crate quick_error;

mod alert;
mod config;
mod edge;
mod feed;
mod monitor;
mod mqtt;
mod shutdown;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "intrusion_sentinel",
    about = "Restricted zone intrusion alerts over MQTT."
)]
struct CliArgs {
    #[structopt(
        parse(from_os_str),
        short = "c",
        long = "config",
        default_value = "config.toml",
        help = "Path to configuration file. See sample_config.toml for format.",
        env = "SENTINEL_CONFIG"
    )]
    config: PathBuf,
    #[structopt(subcommand)]
    role: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Watch the detection feed and publish intrusion alerts
    Edge,
    /// Subscribe to intrusion alerts and raise them on this terminal
    Monitor,
}

#[tokio::main]
async fn main() {
    let args = CliArgs::from_args();
    let cfg = match config::load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Invalid configuration in {}: {}", args.config.display(), e);
            std::process::exit(2);
        }
    };

    let filter = tracing_subscriber::EnvFilter::new(&cfg.system.log_level);
    let installed = match cfg.system.log_format {
        config::LogFormat::Pretty => tracing::subscriber::set_global_default(
            tracing_subscriber::fmt().with_env_filter(filter).finish(),
        ),
        config::LogFormat::Json => tracing::subscriber::set_global_default(
            tracing_subscriber::fmt().json().with_env_filter(filter).finish(),
        ),
    };
    if let Err(e) = installed {
        eprintln!("Unable to install logger: {}", e);
    }

    info!("Intrusion sentinel running as {:?}", args.role);
    trace!("Config: {:?}", cfg);
    let shutdown = shutdown::on_interrupt();

    let result = match args.role {
        Command::Edge => edge::run(cfg, shutdown).await.map_err(|e| e.to_string()),
        Command::Monitor => monitor::run(cfg, shutdown).await.map_err(|e| e.to_string()),
    };
    if let Err(e) = result {
        error!("Startup failed: {}", e);
        std::process::exit(1);
    }
    // Don't let the runtime wait on a frame reader still blocked on stdin
    std::process::exit(0);
}
