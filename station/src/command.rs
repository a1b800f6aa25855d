//! The structured control surface.  Commands are typed requests (the
//! presentation layer never pushes raw bytes here; bulk terminal I/O
//! has its own wire protocol) and every response is a typed payload or
//! a `CoreError` with kind and tag.

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::forward::{ForwardId, ForwardInfo, ForwardSpec};
use crate::node::NodeRecord;
use crate::profiler::ProfilerId;
use crate::ptys::{PtyId, PtyInfo, ShellSpec};
use crate::terminals::TerminalId;
use crate::transfers::{
    DirEntry, SftpSessionId, TransferDirection, TransferId, TransferInfo,
};
use crate::Station;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Command {
    #[serde(rename = "node.create")]
    NodeCreate { descriptor: NodeRecord },
    #[serde(rename = "node.remove")]
    NodeRemove { node_id: String },
    #[serde(rename = "node.list")]
    NodeList,
    #[serde(rename = "node.drill")]
    NodeDrill {
        parent_id: String,
        child: NodeRecord,
    },

    #[serde(rename = "terminal.open")]
    TerminalOpen {
        node_id: String,
        rows: u16,
        cols: u16,
    },
    #[serde(rename = "terminal.resize")]
    TerminalResize {
        terminal_id: TerminalId,
        rows: u16,
        cols: u16,
    },
    #[serde(rename = "terminal.close")]
    TerminalClose { terminal_id: TerminalId },

    #[serde(rename = "sftp.open")]
    SftpOpen { node_id: String },
    #[serde(rename = "sftp.list")]
    SftpList {
        session_id: SftpSessionId,
        #[serde(default)]
        path: Option<PathBuf>,
    },
    #[serde(rename = "sftp.transfer.start")]
    TransferStart {
        /// Restart/resume an existing transfer by id, or enqueue a new
        /// one from the remaining fields.
        #[serde(default)]
        transfer_id: Option<TransferId>,
        #[serde(default)]
        session_id: Option<SftpSessionId>,
        #[serde(default)]
        direction: Option<TransferDirection>,
        #[serde(default)]
        local_path: Option<PathBuf>,
        #[serde(default)]
        remote_path: Option<PathBuf>,
    },
    #[serde(rename = "sftp.transfer.pause")]
    TransferPause { transfer_id: TransferId },
    #[serde(rename = "sftp.transfer.resume")]
    TransferResume { transfer_id: TransferId },
    #[serde(rename = "sftp.transfer.cancel")]
    TransferCancel { transfer_id: TransferId },
    #[serde(rename = "sftp.transfer.list")]
    TransferList,

    #[serde(rename = "forward.add")]
    ForwardAdd { node_id: String, spec: ForwardSpec },
    #[serde(rename = "forward.remove")]
    ForwardRemove { forward_id: ForwardId },
    #[serde(rename = "forward.list")]
    ForwardList { node_id: String },

    #[serde(rename = "pty.spawn")]
    PtySpawn { spec: ShellSpec },
    #[serde(rename = "pty.close")]
    PtyClose { pty_id: PtyId },
    #[serde(rename = "pty.list")]
    PtyList,
    #[serde(rename = "pty.cleanup")]
    PtyCleanup,

    #[serde(rename = "profiler.start")]
    ProfilerStart { node_id: String },
    #[serde(rename = "profiler.stop")]
    ProfilerStop { profiler_id: ProfilerId },

    #[serde(rename = "auth.unlock")]
    AuthUnlock { passphrase: String },
    #[serde(rename = "vault.save")]
    VaultSave { node_id: String, secret: String },
    #[serde(rename = "vault.forget")]
    VaultForget { node_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Nodes { nodes: Vec<NodeRecord> },
    TerminalOpened { terminal_id: TerminalId },
    SftpOpened { session_id: SftpSessionId },
    DirListing { entries: Vec<DirEntry> },
    TransferStarted { transfer_id: TransferId },
    Transfers { transfers: Vec<TransferInfo> },
    ForwardAdded { forward_id: ForwardId },
    Forwards { forwards: Vec<ForwardInfo> },
    PtySpawned { pty_id: PtyId },
    Ptys { ptys: Vec<PtyInfo> },
    PtysRemoved { pty_ids: Vec<PtyId> },
    ProfilerStarted { profiler_id: ProfilerId },
    Error { error: CoreError },
}

/// Run one command to completion.  Never panics on user input; every
/// failure path produces `Response::Error`.
pub async fn dispatch(station: &Arc<Station>, command: Command) -> Response {
    match run(station, command).await {
        Ok(response) => response,
        Err(error) => Response::Error { error },
    }
}

async fn run(station: &Arc<Station>, command: Command) -> CoreResult<Response> {
    match command {
        Command::NodeCreate { descriptor } => {
            station.create_node(descriptor)?;
            Ok(Response::Ok)
        }
        Command::NodeRemove { node_id } => {
            station.remove_node(&node_id)?;
            Ok(Response::Ok)
        }
        Command::NodeList => Ok(Response::Nodes {
            nodes: station.list_nodes(),
        }),
        Command::NodeDrill { parent_id, child } => {
            station.drill_node(&parent_id, child)?;
            Ok(Response::Ok)
        }

        Command::TerminalOpen {
            node_id,
            rows,
            cols,
        } => {
            let terminal_id = station.terminals.open(station, &node_id, rows, cols).await?;
            Ok(Response::TerminalOpened { terminal_id })
        }
        Command::TerminalResize {
            terminal_id,
            rows,
            cols,
        } => {
            station.terminals.resize(terminal_id, rows, cols).await?;
            Ok(Response::Ok)
        }
        Command::TerminalClose { terminal_id } => {
            station.terminals.close(station, terminal_id).await?;
            Ok(Response::Ok)
        }

        Command::SftpOpen { node_id } => {
            let session_id = station.transfers.open_session(station, &node_id).await?;
            Ok(Response::SftpOpened { session_id })
        }
        Command::SftpList { session_id, path } => {
            let entries = station
                .transfers
                .list_dir(station, session_id, path.as_deref())
                .await?;
            Ok(Response::DirListing { entries })
        }
        Command::TransferStart {
            transfer_id: Some(transfer_id),
            ..
        } => {
            station.transfers.start(station, transfer_id)?;
            Ok(Response::TransferStarted { transfer_id })
        }
        Command::TransferStart {
            transfer_id: None,
            session_id,
            direction,
            local_path,
            remote_path,
        } => {
            let (session_id, direction, local_path, remote_path) = match (
                session_id,
                direction,
                local_path,
                remote_path,
            ) {
                (Some(s), Some(d), Some(l), Some(r)) => (s, d, l, r),
                _ => {
                    return Err(CoreError::new(
                        ErrorKind::ProtocolViolation,
                        "transfer.start needs either a transfer_id or \
                         session_id+direction+local_path+remote_path",
                    ))
                }
            };
            let transfer_id = station.transfers.enqueue(
                station,
                session_id,
                direction,
                &local_path,
                &remote_path,
            )?;
            Ok(Response::TransferStarted { transfer_id })
        }
        Command::TransferPause { transfer_id } => {
            station.transfers.pause(transfer_id)?;
            Ok(Response::Ok)
        }
        Command::TransferResume { transfer_id } => {
            station.transfers.start(station, transfer_id)?;
            Ok(Response::Ok)
        }
        Command::TransferCancel { transfer_id } => {
            station.transfers.cancel(transfer_id)?;
            Ok(Response::Ok)
        }
        Command::TransferList => Ok(Response::Transfers {
            transfers: station.transfers.list(),
        }),

        Command::ForwardAdd { node_id, spec } => {
            let forward_id = station.forwards.add(station, &node_id, spec).await?;
            Ok(Response::ForwardAdded { forward_id })
        }
        Command::ForwardRemove { forward_id } => {
            station.forwards.remove(station, forward_id).await?;
            Ok(Response::Ok)
        }
        Command::ForwardList { node_id } => Ok(Response::Forwards {
            forwards: station.forwards.list(&node_id),
        }),

        Command::PtySpawn { spec } => {
            let pty_id = station.ptys.spawn(&spec)?;
            Ok(Response::PtySpawned { pty_id })
        }
        Command::PtyClose { pty_id } => {
            station.ptys.close(pty_id)?;
            Ok(Response::Ok)
        }
        Command::PtyList => Ok(Response::Ptys {
            ptys: station.ptys.list(),
        }),
        Command::PtyCleanup => Ok(Response::PtysRemoved {
            pty_ids: station.ptys.drain_cleanup(),
        }),

        Command::ProfilerStart { node_id } => {
            let profiler_id = station.profilers.start(station, &node_id).await?;
            Ok(Response::ProfilerStarted { profiler_id })
        }
        Command::ProfilerStop { profiler_id } => {
            station.profilers.stop(station, profiler_id)?;
            Ok(Response::Ok)
        }

        Command::AuthUnlock { passphrase } => {
            station.unlock_vault(&passphrase)?;
            Ok(Response::Ok)
        }
        Command::VaultSave { node_id, secret } => {
            station.vault_save(&node_id, secret.as_bytes())?;
            Ok(Response::Ok)
        }
        Command::VaultForget { node_id } => {
            station.vault_forget(&node_id)?;
            Ok(Response::Ok)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_wire_names_are_dotted() {
        let cmd = Command::TerminalOpen {
            node_id: "b".to_string(),
            rows: 24,
            cols: 80,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""op":"terminal.open""#), "{json}");

        let back: Command = serde_json::from_str(
            r#"{"op":"node.list"}"#,
        )
        .unwrap();
        assert!(matches!(back, Command::NodeList));
    }

    #[test]
    fn transfer_start_resume_form() {
        let back: Command =
            serde_json::from_str(r#"{"op":"sftp.transfer.start","transfer_id":7}"#).unwrap();
        match back {
            Command::TransferStart { transfer_id, .. } => {
                assert_eq!(transfer_id, Some(7));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_response_serializes_kind_and_tag() {
        let response = Response::Error {
            error: CoreError::new(ErrorKind::BusyRetryLater, "chain lock is held")
                .with_tag("CHAIN_LOCK_BUSY"),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("BusyRetryLater"), "{json}");
        assert!(json.contains("CHAIN_LOCK_BUSY"), "{json}");
    }
}
