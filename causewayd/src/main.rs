//! CLI entry for the session core.  `serve` exposes the control
//! surface and wire endpoints on a unix socket; the one-shot
//! subcommands exist for scripting and map error kinds onto the
//! documented exit codes.

use clap::{Parser, Subcommand};
use station::config::CoreConfig;
use station::error::ErrorKind;
use station::Station;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;

mod server;

const EXIT_OK: u8 = 0;
const EXIT_UNLOCK_FAILED: u8 = 10;
const EXIT_CONNECTION_FAILED: u8 = 20;
const EXIT_PROTOCOL_VIOLATION: u8 = 30;
const EXIT_INTERNAL: u8 = 40;

#[derive(Parser, Debug)]
#[command(name = "causewayd", about = "multi-session terminal workstation core")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the data directory (node store, vault, known_hosts).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Serve the control surface and wire endpoints on a unix socket.
    Serve {
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Verify the vault passphrase (read from stdin).
    Unlock,
    /// Establish (or reuse) a connection to a node and report health.
    Ping { node_id: String },
}

fn exit_code_for(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::AuthFailed | ErrorKind::AuthRequired => EXIT_UNLOCK_FAILED,
        ErrorKind::Unreachable
        | ErrorKind::Timeout
        | ErrorKind::Transient
        | ErrorKind::HostKeyMismatch
        | ErrorKind::BusyRetryLater => EXIT_CONNECTION_FAILED,
        ErrorKind::ProtocolViolation => EXIT_PROTOCOL_VIOLATION,
        _ => EXIT_INTERNAL,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<CoreConfig> {
    let mut config = match &cli.config {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::default(),
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = Some(data_dir.clone());
    }
    Ok(config)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("causewayd: {err:#}");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    let station = match Station::init(config) {
        Ok(station) => station,
        Err(err) => {
            eprintln!("causewayd: initializing core: {err:#}");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    match cli.cmd {
        Cmd::Serve { socket } => {
            let socket = socket.unwrap_or_else(|| station.config().data_dir().join("causewayd.sock"));
            match smol::block_on(server::run(station, socket)) {
                Ok(()) => ExitCode::from(EXIT_OK),
                Err(err) => {
                    eprintln!("causewayd: {err:#}");
                    ExitCode::from(EXIT_INTERNAL)
                }
            }
        }
        Cmd::Unlock => {
            let mut passphrase = String::new();
            if std::io::stdin().lock().read_line(&mut passphrase).is_err() {
                return ExitCode::from(EXIT_INTERNAL);
            }
            let passphrase = passphrase.trim_end_matches(['\r', '\n']);
            match station.unlock_vault(passphrase) {
                Ok(()) => {
                    println!("vault unlocked");
                    ExitCode::from(EXIT_OK)
                }
                Err(err) => {
                    eprintln!("causewayd: {err}");
                    ExitCode::from(exit_code_for(err.kind))
                }
            }
        }
        Cmd::Ping { node_id } => match smol::block_on(station.resolve_connection(&node_id)) {
            Ok(record) => {
                println!(
                    "node {} is reachable via connection {}",
                    node_id, record.connection_id
                );
                ExitCode::from(EXIT_OK)
            }
            Err(err) => {
                eprintln!("causewayd: {err}");
                ExitCode::from(exit_code_for(err.kind))
            }
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(exit_code_for(ErrorKind::AuthFailed), 10);
        assert_eq!(exit_code_for(ErrorKind::Unreachable), 20);
        assert_eq!(exit_code_for(ErrorKind::Timeout), 20);
        assert_eq!(exit_code_for(ErrorKind::ProtocolViolation), 30);
        assert_eq!(exit_code_for(ErrorKind::Internal), 40);
    }
}
