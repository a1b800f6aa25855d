//! The unix-socket front door.  A client speaks JSON lines on the
//! control surface; an `attach` request upgrades the connection to the
//! binary wire protocol for bulk terminal I/O, starting with the
//! version handshake.

use anyhow::Context;
use serde::Deserialize;
use smol::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use smol::net::unix::{UnixListener, UnixStream};
use station::command::{self, Command};
use station::Station;
use std::path::PathBuf;
use std::sync::Arc;
use wire::{Frame, FrameCodec, PROTOCOL_VERSION};

#[derive(Debug, Deserialize)]
#[serde(tag = "op")]
enum ServerCommand {
    #[serde(rename = "terminal.attach")]
    TerminalAttach { terminal_id: usize },
    #[serde(rename = "pty.attach")]
    PtyAttach { pty_id: usize },
    #[serde(rename = "events.subscribe")]
    EventsSubscribe,
}

pub async fn run(station: Arc<Station>, socket: PathBuf) -> anyhow::Result<()> {
    if socket.exists() {
        std::fs::remove_file(&socket)
            .with_context(|| format!("removing stale socket {}", socket.display()))?;
    }
    let listener = UnixListener::bind(&socket)
        .with_context(|| format!("binding {}", socket.display()))?;
    log::info!("listening on {}", socket.display());

    loop {
        let (stream, _addr) = listener.accept().await?;
        let station = Arc::clone(&station);
        smol::spawn(async move {
            if let Err(err) = serve_client(station, stream).await {
                log::debug!("client session ended: {err:#}");
            }
        })
        .detach();
    }
}

async fn serve_client(station: Arc<Station>, stream: UnixStream) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream.clone());
    let mut writer = stream;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        // Upgrade requests are handled by the server itself; everything
        // else is a core command.
        if let Ok(server_cmd) = serde_json::from_str::<ServerCommand>(trimmed) {
            match server_cmd {
                ServerCommand::TerminalAttach { terminal_id } => {
                    // The client must wait for this ack before sending
                    // its handshake frame; bytes pipelined behind the
                    // attach line are not carried across the upgrade.
                    writer.write_all(b"{\"result\":\"ok\"}\n").await?;
                    let mut stream = reader.into_inner();
                    return serve_terminal_endpoint(station, &mut stream, terminal_id).await;
                }
                ServerCommand::PtyAttach { pty_id } => {
                    writer.write_all(b"{\"result\":\"ok\"}\n").await?;
                    let mut stream = reader.into_inner();
                    return serve_pty_endpoint(station, &mut stream, pty_id).await;
                }
                ServerCommand::EventsSubscribe => {
                    return serve_events(station, writer).await;
                }
            }
        }

        let response = match serde_json::from_str::<Command>(trimmed) {
            Ok(cmd) => command::dispatch(&station, cmd).await,
            Err(err) => command::Response::Error {
                error: station::error::CoreError::new(
                    station::error::ErrorKind::ProtocolViolation,
                    format!("unparseable command: {err}"),
                ),
            },
        };
        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
    }
}

/// Stream every core notification to the client as JSON lines.
async fn serve_events(station: Arc<Station>, mut writer: UnixStream) -> anyhow::Result<()> {
    let (tx, rx) = flume::unbounded::<station::StationNotification>();
    station.subscribe(move |notification| tx.send(notification).is_ok());

    while let Ok(notification) = rx.recv_async().await {
        let mut payload = serde_json::to_vec(&notification)?;
        payload.push(b'\n');
        if writer.write_all(&payload).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn handshake(codec: &FrameCodec, stream: &mut UnixStream) -> anyhow::Result<()> {
    match codec.decode_async(stream).await? {
        Frame::Handshake(vers) if &vers == PROTOCOL_VERSION => {
            codec
                .encode_async(&Frame::Handshake(*PROTOCOL_VERSION), stream)
                .await?;
            Ok(())
        }
        other => {
            codec
                .encode_async(
                    &Frame::ProtocolError("expected version handshake".to_string()),
                    stream,
                )
                .await
                .ok();
            anyhow::bail!("bad handshake frame {:?}", other.frame_type());
        }
    }
}

async fn serve_terminal_endpoint(
    station: Arc<Station>,
    stream: &mut UnixStream,
    terminal_id: usize,
) -> anyhow::Result<()> {
    let codec = FrameCodec::new().with_max_payload(station.config().frame_payload_cap);
    handshake(&codec, stream).await?;

    let (frames, scrollback) = station
        .terminals
        .attach_endpoint(terminal_id)
        .map_err(|err| anyhow::anyhow!("{err}"))?;

    let result = pump_endpoint(
        &station,
        stream,
        &codec,
        frames,
        scrollback,
        EndpointTarget::Terminal(terminal_id),
    )
    .await;
    station.terminals.detach_endpoint(terminal_id);
    result
}

async fn serve_pty_endpoint(
    station: Arc<Station>,
    stream: &mut UnixStream,
    pty_id: usize,
) -> anyhow::Result<()> {
    let codec = FrameCodec::new().with_max_payload(station.config().frame_payload_cap);
    handshake(&codec, stream).await?;

    let (frames, scrollback) = station
        .ptys
        .attach_endpoint(pty_id)
        .map_err(|err| anyhow::anyhow!("{err}"))?;

    let result = pump_endpoint(
        &station,
        stream,
        &codec,
        frames,
        scrollback,
        EndpointTarget::Pty(pty_id),
    )
    .await;
    station.ptys.detach_endpoint(pty_id);
    result
}

enum EndpointTarget {
    Terminal(usize),
    Pty(usize),
}

/// Shuttle frames both ways until the peer goes away or violates the
/// protocol.  A violation earns a ProtocolError frame and closes only
/// this endpoint; no other session is affected.
async fn pump_endpoint(
    station: &Arc<Station>,
    stream: &mut UnixStream,
    codec: &FrameCodec,
    frames: flume::Receiver<Frame>,
    scrollback: Vec<u8>,
    target: EndpointTarget,
) -> anyhow::Result<()> {
    use smol::future::FutureExt;

    if !scrollback.is_empty() {
        codec
            .encode_async(&Frame::Output(scrollback), stream)
            .await?;
    }

    let mut write_half = stream.clone();
    let outbound = async move {
        while let Ok(frame) = frames.recv_async().await {
            if codec.encode_async(&frame, &mut write_half).await.is_err() {
                break;
            }
        }
    };

    let mut read_half = stream.clone();
    let inbound = async move {
        loop {
            match codec.decode_async(&mut read_half).await {
                Ok(Frame::Input(data)) => {
                    let result = match &target {
                        EndpointTarget::Terminal(id) => station.terminals.write(*id, &data),
                        EndpointTarget::Pty(id) => station.ptys.write(*id, &data),
                    };
                    if let Err(err) = result {
                        log::debug!("endpoint input rejected: {err}");
                        codec
                            .encode_async(&Frame::ProtocolError(err.message), &mut read_half)
                            .await
                            .ok();
                        break;
                    }
                }
                Ok(Frame::Resize { rows, cols }) => {
                    let result = match &target {
                        EndpointTarget::Terminal(id) => {
                            station.terminals.resize(*id, rows, cols).await
                        }
                        EndpointTarget::Pty(id) => station.ptys.resize(*id, rows, cols),
                    };
                    if let Err(err) = result {
                        log::debug!("endpoint resize rejected: {err}");
                    }
                }
                Ok(Frame::Ack) | Ok(Frame::Bell) => {}
                Ok(other) => {
                    codec
                        .encode_async(
                            &Frame::ProtocolError(format!(
                                "unexpected frame {} on endpoint",
                                other.name()
                            )),
                            &mut read_half,
                        )
                        .await
                        .ok();
                    break;
                }
                Err(err) if err.is_violation() => {
                    codec
                        .encode_async(&Frame::ProtocolError(err.to_string()), &mut read_half)
                        .await
                        .ok();
                    break;
                }
                Err(_) => break,
            }
        }
    };

    outbound.or(inbound).await;
    Ok(())
}
