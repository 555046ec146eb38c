//! Mixer broadcaster
//!
//! Relay server for collaborative scene editing. Clients join named rooms and
//! every command sent to a room is sequenced and fanned out to its members.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use mixer_net::{Broadcaster, BroadcasterConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONFIG_FILE: &str = "broadcaster.toml";

#[derive(Debug, Parser)]
#[command(name = "mixer-broadcaster", version, about = "Room relay for Mixer clients")]
struct Args {
    /// TOML config file; defaults to broadcaster.toml in the user config dir
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:12800
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Committed commands kept per room
    #[arg(long)]
    replay_capacity: Option<usize>,

    /// Milliseconds an empty room survives before it is dropped
    #[arg(long)]
    idle_grace_ms: Option<u64>,

    #[arg(long)]
    heartbeat_timeout_ms: Option<u64>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, config: &mut BroadcasterConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(capacity) = self.replay_capacity {
            config.replay_capacity = capacity;
        }
        if let Some(grace) = self.idle_grace_ms {
            config.idle_room_grace_ms = grace;
        }
        if let Some(timeout) = self.heartbeat_timeout_ms {
            config.heartbeat_timeout_ms = timeout;
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "mixer", "mixer").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

fn load_config(args: &Args) -> Result<BroadcasterConfig> {
    let mut config = match &args.config {
        Some(path) => BroadcasterConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => match default_config_path().filter(|p| p.is_file()) {
            Some(path) => {
                tracing::info!(path = %path.display(), "Using config file");
                BroadcasterConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?
            }
            None => BroadcasterConfig::default(),
        },
    };

    args.apply(&mut config);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    tracing::info!("Starting Mixer broadcaster");

    let config = load_config(&args)?;
    let server = Broadcaster::listen(config)
        .await
        .context("failed to start broadcaster")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    tracing::info!(rooms = server.rooms().await.len(), "Shutting down");
    server.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file() {
        let args = Args::try_parse_from([
            "mixer-broadcaster",
            "--listen",
            "0.0.0.0:9000",
            "--replay-capacity",
            "8",
        ])
        .unwrap();

        let mut config = BroadcasterConfig::from_toml("replay_capacity = 64\nidle_room_grace_ms = 5").unwrap();
        args.apply(&mut config);

        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.replay_capacity, 8);
        assert_eq!(config.idle_room_grace_ms, 5);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let args = Args::try_parse_from([
            "mixer-broadcaster",
            "--config",
            "/nonexistent/broadcaster.toml",
        ])
        .unwrap();
        assert!(load_config(&args).is_err());

        let args = Args::try_parse_from(["mixer-broadcaster", "--heartbeat-timeout-ms", "1"]).unwrap();
        let mut config = BroadcasterConfig::default();
        args.apply(&mut config);
        assert!(config.validate().is_err());
    }
}
