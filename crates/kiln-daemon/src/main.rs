//! Kiln daemon entry point.
//!
//! This binary starts the kiln daemon socket server that clients use to
//! manage instances, run operations, watch boards and debug sketches.

use std::path::PathBuf;

use clap::Parser;
use kiln_daemon::ServerOptions;
use kiln_daemon::logging::{self, LogLevel, LogOptions};
use tracing::info;

/// Kiln daemon - socket server for board tooling
#[derive(Parser, Debug)]
#[command(name = "kiln-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Custom socket path (defaults to `$XDG_RUNTIME_DIR/kiln.sock` or `/tmp/kiln.sock`)
    #[arg(long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Config file (defaults to `~/.config/kiln/config.json`)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Data directory for indexes and installed platforms
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level for kiln crates (`KILN_LOG` or `RUST_LOG` override it)
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Also write a daily-rotated log file into this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _log_guard = logging::init(&LogOptions {
        level: args.log_level,
        dir: args.log_dir,
    })?;

    info!("Starting kiln daemon...");

    kiln_daemon::run(ServerOptions {
        socket_path: args.socket_path,
        config_file: args.config,
        data_dir: args.data_dir,
    })
    .await?;

    info!("Kiln daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_flags_parse() {
        let args = Args::try_parse_from([
            "kiln-daemon",
            "--log-level",
            "debug",
            "--log-dir",
            "/var/log/kiln",
        ])
        .unwrap();
        assert_eq!(args.log_level, LogLevel::Debug);
        assert_eq!(args.log_dir, Some(PathBuf::from("/var/log/kiln")));

        let args = Args::try_parse_from(["kiln-daemon"]).unwrap();
        assert_eq!(args.log_level, LogLevel::Info);
        assert!(args.log_dir.is_none());
    }
}
