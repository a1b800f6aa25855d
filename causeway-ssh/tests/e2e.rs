//! Exercises against a live ssh server.  These only run when the
//! environment names a target, e.g.
//!
//!   CAUSEWAY_TEST_HOST=localhost CAUSEWAY_TEST_USER=$USER \
//!       cargo test -p causeway-ssh
//!
//! Authentication uses the running ssh-agent.

use causeway_ssh::{Auth, OpenOptions, Session, SessionConfig, SessionEvent};
use portable_pty::PtySize;
use std::io::Read;
use std::path::Path;

fn target() -> Option<SessionConfig> {
    let host = std::env::var("CAUSEWAY_TEST_HOST").ok()?;
    let user = std::env::var("CAUSEWAY_TEST_USER")
        .ok()
        .or_else(|| std::env::var("USER").ok())?;
    let port = std::env::var("CAUSEWAY_TEST_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(22);

    let known_hosts = std::env::temp_dir().join("causeway-ssh-test-known_hosts");
    Some(SessionConfig::new(&host, port, &user, Auth::Agent).known_hosts(known_hosts))
}

async fn connect(config: SessionConfig) -> anyhow::Result<Session> {
    let (session, events) = Session::connect(config)?;
    loop {
        match events.recv_async().await? {
            SessionEvent::Banner(_) => {}
            SessionEvent::HostKeyRecorded { fingerprint } => {
                eprintln!("trusted test host: {fingerprint}");
            }
            SessionEvent::NeedSecret(prompts) => {
                anyhow::bail!(
                    "secret prompt raised ({} prompts); agent auth only in tests",
                    prompts.prompts.len()
                )
            }
            SessionEvent::Failed(err) => anyhow::bail!("{err}"),
            SessionEvent::Ready => return Ok(session),
        }
    }
}

#[test]
fn exec_round_trip() {
    let config = match target() {
        Some(config) => config,
        None => return,
    };
    smol::block_on(async {
        let session = connect(config).await.unwrap();
        let streams = session
            .run("echo causeway-$((20+3))", None)
            .await
            .unwrap();
        let mut out = streams.io;
        let output = smol::unblock(move || {
            let mut buf = String::new();
            out.read_to_string(&mut buf).ok();
            buf
        })
        .await;
        assert!(output.contains("causeway-23"), "stdout: {output:?}");
    });
}

#[test]
fn pty_shell_produces_output() {
    let config = match target() {
        Some(config) => config,
        None => return,
    };
    smol::block_on(async {
        let session = connect(config).await.unwrap();
        let (pty, _child) = session
            .open_shell(
                "xterm-256color",
                PtySize {
                    rows: 24,
                    cols: 80,
                    pixel_width: 0,
                    pixel_height: 0,
                },
                Some("printf 'marker-%d\\n' $((40+2))"),
            )
            .await
            .unwrap();

        let mut reader = pty.clone_reader().unwrap();
        let output = smol::unblock(move || {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            while let Ok(n) = reader.read(&mut chunk) {
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(9).any(|w| w == b"marker-42") {
                    break;
                }
            }
            buf
        })
        .await;
        assert!(output.windows(9).any(|w| w == b"marker-42"));
    });
}

#[test]
fn sftp_write_seek_read() {
    let config = match target() {
        Some(config) => config,
        None => return,
    };
    smol::block_on(async {
        let session = connect(config).await.unwrap();
        let sftp = session.sftp();
        let path = Path::new("/tmp/causeway-sftp-test.bin");

        let file = sftp.open(path, OpenOptions::writing()).await.unwrap();
        file.write(b"0123456789".to_vec()).await.unwrap();
        file.close().await.unwrap();

        // Seek is the primitive transfer resume relies on
        let file = sftp.open(path, OpenOptions::reading()).await.unwrap();
        file.seek(4).await.unwrap();
        let tail = file.read(64).await.unwrap();
        assert_eq!(tail, b"456789");
        file.close().await.unwrap();

        let meta = sftp.stat(path).await.unwrap();
        assert_eq!(meta.size, Some(10));
        sftp.remove_file(path).await.unwrap();
    });
}
