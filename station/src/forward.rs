//! Port forwarding: local binds, remote binds and dynamic SOCKS5.
//! Every active forward is an independent accept task; every accepted
//! connection gets a handler task that owns both ends of its splice —
//! no shared channel handles on the hot path.
//!
//! On link-down forwards are suspended in place; the record (and the
//! UI's view of it) survives, and the orchestrator re-arms after the
//! transport returns.

use crate::config::CoreConfig;
use crate::dependents::{DependentKey, DependentKind, DependentState};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::node::NodeId;
use crate::util;
use crate::Station;
use causeway_ssh::{RemoteBinding, Session, Tunnel};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::TcpListener;
use smol::Timer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type ForwardId = usize;

static FORWARD_ID: AtomicUsize = AtomicUsize::new(1);

fn alloc_forward_id() -> ForwardId {
    FORWARD_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardDirection {
    Local,
    Remote,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub direction: ForwardDirection,
    pub bind_addr: String,
    pub bind_port: u16,
    /// Destination; not used for dynamic forwards.
    pub dest_host: Option<String>,
    pub dest_port: Option<u16>,
}

impl ForwardSpec {
    fn validate(&self) -> CoreResult<()> {
        match self.direction {
            ForwardDirection::Dynamic => Ok(()),
            _ => {
                if self.dest_host.is_none() || self.dest_port.is_none() {
                    Err(CoreError::new(
                        ErrorKind::ProtocolViolation,
                        "forward spec requires a destination host and port",
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardState {
    Active,
    Suspended,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardInfo {
    pub forward_id: ForwardId,
    pub node_id: NodeId,
    pub spec: ForwardSpec,
    pub state: ForwardState,
}

pub struct ForwardRecord {
    pub forward_id: ForwardId,
    pub node_id: NodeId,
    pub spec: ForwardSpec,
    state: Mutex<ForwardState>,
    /// Signals the current accept task to stand down and unbind.
    stop: Mutex<Option<flume::Sender<()>>>,
    remote_binding: Mutex<Option<RemoteBinding>>,
}

impl ForwardRecord {
    pub fn state(&self) -> ForwardState {
        *self.state.lock()
    }

    fn info(&self) -> ForwardInfo {
        ForwardInfo {
            forward_id: self.forward_id,
            node_id: self.node_id.clone(),
            spec: self.spec.clone(),
            state: self.state(),
        }
    }
}

pub struct ForwardingManager {
    forwards: RwLock<HashMap<ForwardId, Arc<ForwardRecord>>>,
    idle_timeout: Duration,
    channel_open_timeout: Duration,
}

impl ForwardingManager {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            forwards: RwLock::new(HashMap::new()),
            idle_timeout: config.forward_idle(),
            channel_open_timeout: config.channel_open_timeout(),
        }
    }

    fn get(&self, forward_id: ForwardId) -> CoreResult<Arc<ForwardRecord>> {
        self.forwards
            .read()
            .get(&forward_id)
            .map(Arc::clone)
            .ok_or_else(|| CoreError::not_found(format!("forward {forward_id}")))
    }

    pub fn for_node(&self, node_id: &str) -> Vec<Arc<ForwardRecord>> {
        self.forwards
            .read()
            .values()
            .filter(|f| f.node_id == node_id)
            .map(Arc::clone)
            .collect()
    }

    pub fn list(&self, node_id: &str) -> Vec<ForwardInfo> {
        self.for_node(node_id).iter().map(|f| f.info()).collect()
    }

    pub async fn add(
        &self,
        station: &Arc<Station>,
        node_id: &str,
        spec: ForwardSpec,
    ) -> CoreResult<ForwardId> {
        spec.validate()?;
        station.resolve_connection(node_id).await?;

        let record = Arc::new(ForwardRecord {
            forward_id: alloc_forward_id(),
            node_id: node_id.to_string(),
            spec,
            state: Mutex::new(ForwardState::Suspended),
            stop: Mutex::new(None),
            remote_binding: Mutex::new(None),
        });

        self.arm(station, &record).await?;
        self.forwards
            .write()
            .insert(record.forward_id, Arc::clone(&record));
        station.register_dependent(
            DependentKey::new(DependentKind::Forward, record.forward_id),
            node_id,
        )?;
        Ok(record.forward_id)
    }

    pub async fn remove(&self, station: &Arc<Station>, forward_id: ForwardId) -> CoreResult<()> {
        let record = self.get(forward_id)?;
        self.suspend(&record).await;
        self.forwards.write().remove(&forward_id);
        station.unregister_dependent(&DependentKey::new(DependentKind::Forward, forward_id));
        Ok(())
    }

    /// Bring a forward live: bind the listener or issue the remote
    /// bind request, then hand accepted connections to handler tasks.
    async fn arm(&self, station: &Arc<Station>, record: &Arc<ForwardRecord>) -> CoreResult<()> {
        let session = node_session(station, &record.node_id)?;
        let (stop_tx, stop_rx) = flume::bounded(1);
        let idle = self.idle_timeout;
        let open_timeout = self.channel_open_timeout;

        match record.spec.direction {
            ForwardDirection::Local | ForwardDirection::Dynamic => {
                let bind = format!("{}:{}", record.spec.bind_addr, record.spec.bind_port);
                let listener = TcpListener::bind(bind.as_str()).await.map_err(|err| {
                    CoreError::new(
                        ErrorKind::ResourceExhausted,
                        format!("binding {bind}: {err}"),
                    )
                })?;
                let record_task = Arc::clone(record);
                smol::spawn(async move {
                    accept_loop(record_task, listener, session, stop_rx, idle, open_timeout)
                        .await;
                })
                .detach();
            }
            ForwardDirection::Remote => {
                let dest_host = record.spec.dest_host.clone().expect("validated");
                let dest_port = record.spec.dest_port.expect("validated");
                let binding = session
                    .bind_remote(&record.spec.bind_addr, record.spec.bind_port)
                    .await
                    .map_err(|err| {
                        CoreError::new(
                            ErrorKind::ResourceExhausted,
                            format!("remote bind: {err:#}"),
                        )
                    })?;
                log::debug!(
                    "forward {}: remote peer listening on port {}",
                    record.forward_id,
                    binding.bound_port
                );
                let announced = binding.announced.clone();
                record.remote_binding.lock().replace(binding);
                let record_task = Arc::clone(record);
                smol::spawn(async move {
                    remote_accept_loop(record_task, announced, stop_rx, dest_host, dest_port, idle)
                        .await;
                })
                .detach();
            }
        }

        record.stop.lock().replace(stop_tx);
        *record.state.lock() = ForwardState::Active;
        Ok(())
    }

    /// Stop accepting without removing the record.  Existing spliced
    /// connections die with their channels.
    pub async fn suspend(&self, record: &Arc<ForwardRecord>) {
        if let Some(stop) = record.stop.lock().take() {
            stop.try_send(()).ok();
        }
        let binding = record.remote_binding.lock().take();
        if let Some(binding) = binding {
            binding.release().await.ok();
        }
        *record.state.lock() = ForwardState::Suspended;
    }

    pub async fn rearm(
        &self,
        station: &Arc<Station>,
        forward_id: ForwardId,
    ) -> CoreResult<()> {
        let record = self.get(forward_id)?;
        if record.state() == ForwardState::Active {
            return Ok(());
        }
        match self.arm(station, &record).await {
            Ok(()) => {
                station.dependents.lock().set_state(
                    &DependentKey::new(DependentKind::Forward, forward_id),
                    DependentState::Active,
                );
                Ok(())
            }
            Err(err) => {
                *record.state.lock() = ForwardState::Failed;
                station.dependents.lock().set_state(
                    &DependentKey::new(DependentKind::Forward, forward_id),
                    DependentState::Errored,
                );
                Err(err)
            }
        }
    }

    pub async fn suspend_node(&self, station: &Arc<Station>, node_id: &str) {
        for record in self.for_node(node_id) {
            self.suspend(&record).await;
            station.dependents.lock().set_state(
                &DependentKey::new(DependentKind::Forward, record.forward_id),
                DependentState::Suspended,
            );
        }
    }

    pub async fn suspend_all_nodes(&self) {
        let records: Vec<Arc<ForwardRecord>> =
            self.forwards.read().values().map(Arc::clone).collect();
        for record in records {
            self.suspend(&record).await;
        }
    }
}

fn node_session(station: &Arc<Station>, node_id: &str) -> CoreResult<Session> {
    let connection_id = station.node_connection(node_id).ok_or_else(|| {
        CoreError::new(ErrorKind::NotFound, format!("node {node_id} is not connected"))
    })?;
    station.pool.borrow(connection_id).ok_or_else(|| {
        CoreError::new(
            ErrorKind::BusyRetryLater,
            format!("connection for node {node_id} is not active"),
        )
    })
}

async fn accept_loop(
    record: Arc<ForwardRecord>,
    listener: TcpListener,
    session: Session,
    stop: flume::Receiver<()>,
    idle: Duration,
    open_timeout: Duration,
) {
    use smol::future::FutureExt;
    loop {
        let accepted = async { Some(listener.accept().await) }
            .or(async {
                stop.recv_async().await.ok();
                None
            })
            .await;

        let (stream, peer) = match accepted {
            Some(Ok(pair)) => pair,
            Some(Err(err)) => {
                log::debug!("forward {} accept: {err}", record.forward_id);
                *record.state.lock() = ForwardState::Failed;
                break;
            }
            // Stop requested: dropping the listener unbinds the port
            None => break,
        };
        log::trace!("forward {} accepted {}", record.forward_id, peer);

        let record = Arc::clone(&record);
        let session = session.clone();
        smol::spawn(async move {
            let result = match record.spec.direction {
                ForwardDirection::Local => {
                    handle_local_conn(&record, stream, session, idle, open_timeout).await
                }
                ForwardDirection::Dynamic => {
                    handle_socks_conn(&record, stream, session, idle, open_timeout).await
                }
                ForwardDirection::Remote => unreachable!("remote forwards have no tcp listener"),
            };
            if let Err(err) = result {
                log::debug!("forward {} handler: {err:#}", record.forward_id);
            }
        })
        .detach();
    }
    log::trace!("forward {} accept loop exited", record.forward_id);
}

async fn handle_local_conn(
    record: &ForwardRecord,
    stream: smol::net::TcpStream,
    session: Session,
    idle: Duration,
    open_timeout: Duration,
) -> anyhow::Result<()> {
    let dest_host = record.spec.dest_host.clone().expect("validated");
    let dest_port = record.spec.dest_port.expect("validated");

    let channel = util::timeout(open_timeout, "forward channel open", async {
        session
            .open_tunnel(&dest_host, dest_port)
            .await
            .map_err(Into::into)
    })
    .await
    .map_err(|err| anyhow::anyhow!("{err}"))?;

    let channel_stream = util::fd_to_async_stream(channel.into_fd())?;
    splice(stream, channel_stream, idle).await;
    Ok(())
}

async fn handle_socks_conn(
    record: &ForwardRecord,
    mut stream: smol::net::TcpStream,
    session: Session,
    idle: Duration,
    open_timeout: Duration,
) -> anyhow::Result<()> {
    let (host, port) = socks5_handshake(&mut stream).await?;
    log::trace!(
        "forward {} socks request for {}:{}",
        record.forward_id,
        host,
        port
    );

    // Name resolution happens on the remote side: the hostname rides
    // the tunnel open request untouched.
    let channel = util::timeout(open_timeout, "socks channel open", async {
        session
            .open_tunnel(&host, port)
            .await
            .map_err(Into::into)
    })
    .await;

    match channel {
        Ok(channel) => {
            socks5_reply(&mut stream, true).await?;
            let channel_stream = util::fd_to_async_stream(channel.into_fd())?;
            splice(stream, channel_stream, idle).await;
            Ok(())
        }
        Err(err) => {
            socks5_reply(&mut stream, false).await.ok();
            Err(anyhow::anyhow!("{err}"))
        }
    }
}

async fn remote_accept_loop(
    record: Arc<ForwardRecord>,
    announced: flume::Receiver<Tunnel>,
    stop: flume::Receiver<()>,
    dest_host: String,
    dest_port: u16,
    idle: Duration,
) {
    use smol::future::FutureExt;
    loop {
        let inbound = async { announced.recv_async().await.ok() }
            .or(async {
                stop.recv_async().await.ok();
                None
            })
            .await;

        let channel = match inbound {
            Some(channel) => channel,
            None => break,
        };

        let record_id = record.forward_id;
        let dest = format!("{dest_host}:{dest_port}");
        smol::spawn(async move {
            let result: anyhow::Result<()> = async {
                let local = smol::net::TcpStream::connect(dest.as_str()).await?;
                let channel_stream = util::fd_to_async_stream(channel.into_fd())?;
                splice(local, channel_stream, idle).await;
                Ok(())
            }
            .await;
            if let Err(err) = result {
                log::debug!("forward {record_id} remote handler: {err:#}");
            }
        })
        .detach();
    }
    log::trace!("forward {} remote accept loop exited", record.forward_id);
}

/// Bidirectional copy owned by this single task.  Terminates when
/// either direction finishes or when both directions sit idle past the
/// limit.
async fn splice<A, B>(a: A, b: B, idle: Duration)
where
    A: smol::io::AsyncRead + smol::io::AsyncWrite + Unpin,
    B: smol::io::AsyncRead + smol::io::AsyncWrite + Unpin,
{
    use smol::future::FutureExt;

    let activity = Arc::new(Mutex::new(Instant::now()));
    let (ar, aw) = smol::io::split(a);
    let (br, bw) = smol::io::split(b);

    let up = copy_with_activity(ar, bw, Arc::clone(&activity));
    let down = copy_with_activity(br, aw, Arc::clone(&activity));
    let watchdog = async {
        loop {
            Timer::after(Duration::from_secs(5).min(idle)).await;
            if activity.lock().elapsed() > idle {
                log::trace!("splice idle timeout");
                break;
            }
        }
    };

    up.or(down).or(watchdog).await;
}

async fn copy_with_activity<R, W>(mut r: R, mut w: W, activity: Arc<Mutex<Instant>>)
where
    R: smol::io::AsyncRead + Unpin,
    W: smol::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match r.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if w.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                *activity.lock() = Instant::now();
            }
        }
    }
    w.close().await.ok();
}

// ----- SOCKS5 (RFC 1928), no-auth, CONNECT only ----------------------

const SOCKS_VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

/// Decode the destination from the address portion of a CONNECT
/// request: `atyp` plus the raw address+port bytes that follow it.
fn socks5_dest(atyp: u8, payload: &[u8]) -> Result<(String, u16), &'static str> {
    match atyp {
        ATYP_IPV4 => {
            if payload.len() != 6 {
                return Err("bad ipv4 address length");
            }
            let host = format!("{}.{}.{}.{}", payload[0], payload[1], payload[2], payload[3]);
            let port = u16::from_be_bytes([payload[4], payload[5]]);
            Ok((host, port))
        }
        ATYP_DOMAIN => {
            let len = *payload.first().ok_or("missing domain length")? as usize;
            if payload.len() != 1 + len + 2 {
                return Err("bad domain length");
            }
            let host = std::str::from_utf8(&payload[1..1 + len])
                .map_err(|_| "domain is not utf-8")?
                .to_string();
            let port = u16::from_be_bytes([payload[1 + len], payload[2 + len]]);
            Ok((host, port))
        }
        ATYP_IPV6 => {
            if payload.len() != 18 {
                return Err("bad ipv6 address length");
            }
            let mut segments = [0u16; 8];
            for (i, segment) in segments.iter_mut().enumerate() {
                *segment = u16::from_be_bytes([payload[i * 2], payload[i * 2 + 1]]);
            }
            let host = std::net::Ipv6Addr::from(segments).to_string();
            let port = u16::from_be_bytes([payload[16], payload[17]]);
            Ok((host, port))
        }
        _ => Err("unsupported address type"),
    }
}

async fn socks5_handshake(stream: &mut smol::net::TcpStream) -> anyhow::Result<(String, u16)> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        anyhow::bail!("not a socks5 client (version {})", head[0]);
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, 0xff]).await?;
        anyhow::bail!("client offers no acceptable auth method");
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[1] != CMD_CONNECT {
        anyhow::bail!("unsupported socks command {}", request[1]);
    }
    let atyp = request[3];
    let payload = match atyp {
        ATYP_IPV4 => {
            let mut buf = vec![0u8; 6];
            stream.read_exact(&mut buf).await?;
            buf
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf).await?;
            let mut full = vec![len[0]];
            full.extend_from_slice(&buf);
            full
        }
        ATYP_IPV6 => {
            let mut buf = vec![0u8; 18];
            stream.read_exact(&mut buf).await?;
            buf
        }
        other => anyhow::bail!("unsupported address type {other}"),
    };

    socks5_dest(atyp, &payload).map_err(|err| anyhow::anyhow!(err))
}

async fn socks5_reply(stream: &mut smol::net::TcpStream, ok: bool) -> anyhow::Result<()> {
    let code = if ok { 0 } else { 5 };
    stream
        .write_all(&[SOCKS_VERSION, code, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn domain_payload(name: &[u8], port: u16) -> Vec<u8> {
        let mut payload = vec![name.len() as u8];
        payload.extend_from_slice(name);
        payload.extend_from_slice(&port.to_be_bytes());
        payload
    }

    fn ipv6_loopback_payload(port: u16) -> Vec<u8> {
        let mut payload = vec![0u8; 18];
        payload[15] = 1; // ::1
        payload[16..18].copy_from_slice(&port.to_be_bytes());
        payload
    }

    #[rstest]
    #[case::ipv4(ATYP_IPV4, vec![127, 0, 0, 1, 0x17, 0x70], "127.0.0.1", 6000)]
    #[case::domain(ATYP_DOMAIN, domain_payload(b"db.example", 5432), "db.example", 5432)]
    #[case::ipv6(ATYP_IPV6, ipv6_loopback_payload(443), "::1", 443)]
    fn dest_parses(
        #[case] atyp: u8,
        #[case] payload: Vec<u8>,
        #[case] host: &str,
        #[case] port: u16,
    ) {
        assert_eq!(
            socks5_dest(atyp, &payload).unwrap(),
            (host.to_string(), port)
        );
    }

    #[rstest]
    #[case::short_ipv4(ATYP_IPV4, vec![1, 2, 3])]
    #[case::lying_domain_len(ATYP_DOMAIN, vec![5, b'a', b'b'])]
    #[case::unknown_atyp(0x7f, vec![0; 6])]
    fn dest_rejects_garbage(#[case] atyp: u8, #[case] payload: Vec<u8>) {
        assert!(socks5_dest(atyp, &payload).is_err());
    }

    #[test]
    fn spec_validation() {
        let spec = ForwardSpec {
            direction: ForwardDirection::Local,
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 6001,
            dest_host: None,
            dest_port: None,
        };
        assert!(spec.validate().is_err());

        let spec = ForwardSpec {
            direction: ForwardDirection::Dynamic,
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 1080,
            dest_host: None,
            dest_port: None,
        };
        assert!(spec.validate().is_ok());
    }
}
