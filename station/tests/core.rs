//! Core behaviors that need no live ssh server: the node index and its
//! chain arithmetic, the dependent bookkeeping invariant, the pty
//! registry lifecycle, and the control-surface dispatch for local
//! operations.
//!
//! The station is a process singleton, so everything that touches it
//! runs inside one test body, sequentially.

use station::command::{self, Command, Response};
use station::config::CoreConfig;
use station::error::ErrorKind;
use station::node::{AuthDescriptor, NodeOrigin, NodeRecord};
use station::ptys::ShellSpec;
use station::Station;
use std::time::{Duration, Instant};

fn record(id: &str, parent: Option<&str>) -> NodeRecord {
    NodeRecord {
        id: id.to_string(),
        name: id.to_uppercase(),
        host: format!("{id}.test"),
        port: 22,
        username: "u".to_string(),
        auth: AuthDescriptor::Agent,
        parent: parent.map(|p| p.to_string()),
        origin: NodeOrigin::Manual,
        group: None,
    }
}

#[test]
fn station_core_behaviors() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CoreConfig::default();
    config.data_dir = Some(dir.path().to_path_buf());
    let station = Station::init(config).unwrap();

    // ---- node index and chain arithmetic ----
    station.create_node(record("a", None)).unwrap();
    station.create_node(record("b", Some("a"))).unwrap();
    station.create_node(record("c", Some("b"))).unwrap();
    station.create_node(record("other", None)).unwrap();

    assert_eq!(
        station.ancestors_of("c").unwrap(),
        vec!["a".to_string(), "b".to_string()]
    );
    assert_eq!(station.node_depth("a"), 0);
    assert_eq!(station.node_depth("c"), 2);

    let descendants = station.descendants_of("a");
    assert!(descendants.contains(&"b".to_string()));
    assert!(descendants.contains(&"c".to_string()));
    assert!(!descendants.contains(&"other".to_string()));

    let err = station.create_node(record("a", None)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadyExists);

    let err = station
        .create_node(record("orphan", Some("missing")))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);

    // A node with children refuses removal
    let err = station.remove_node("a").unwrap_err();
    assert_eq!(err.kind, ErrorKind::BusyRetryLater);

    // Drill-down stamps parentage and origin
    station.drill_node("c", record("leaf", None)).unwrap();
    let leaf = station.node_record("leaf").unwrap();
    assert_eq!(leaf.parent.as_deref(), Some("c"));
    assert_eq!(leaf.origin, NodeOrigin::DrillDown);
    station.remove_node("leaf").unwrap();

    // Node order is the store order
    let ids: Vec<String> = station.list_nodes().into_iter().map(|r| r.id).collect();
    k9::assert_equal!(ids, vec!["a", "b", "c", "other"]);

    // ---- generations are strictly increasing per node ----
    let g1 = station
        .with_runtime("b", |runtime| runtime.next_generation())
        .unwrap();
    let g2 = station
        .with_runtime("b", |runtime| runtime.next_generation())
        .unwrap();
    assert!(g2 > g1);

    // ---- events stream carries generation and readiness ----
    let (tx, rx) = flume::unbounded();
    station.subscribe(move |n| tx.send(n).is_ok());
    station.emit_readiness("b", station::node::NodeReadiness::Connecting);
    match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
        station::StationNotification::NodeReadiness {
            node_id,
            readiness,
            generation,
        } => {
            assert_eq!(node_id, "b");
            assert_eq!(readiness, station::node::NodeReadiness::Connecting);
            assert!(generation > g2);
        }
        other => panic!("unexpected notification {other:?}"),
    }

    // ---- pty registry lifecycle ----
    smol::block_on(async {
        let spec = ShellSpec {
            shell: Some("/bin/sh".to_string()),
            args: vec!["-c".to_string(), "exit 0".to_string()],
            ..Default::default()
        };
        let response = command::dispatch(&station, Command::PtySpawn { spec }).await;
        let pty_id = match response {
            Response::PtySpawned { pty_id } => pty_id,
            other => panic!("unexpected {other:?}"),
        };

        // The child exits immediately; cleanup should reap it
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let removed = station.ptys.drain_cleanup();
            if removed.contains(&pty_id) {
                break;
            }
            assert!(
                Instant::now() < deadline,
                "pty {pty_id} was never reaped: {:?}",
                station.ptys.list()
            );
            smol::Timer::after(Duration::from_millis(50)).await;
        }
        assert!(station.ptys.list().is_empty());

        // Writing to a vanished pty is a clean error
        let response = command::dispatch(
            &station,
            Command::PtyClose { pty_id },
        )
        .await;
        match response {
            Response::Error { error } => assert_eq!(error.kind, ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    });

    // ---- operations on unconnected nodes fail cleanly ----
    smol::block_on(async {
        let response = command::dispatch(
            &station,
            Command::ForwardList {
                node_id: "b".to_string(),
            },
        )
        .await;
        match response {
            Response::Forwards { forwards } => assert!(forwards.is_empty()),
            other => panic!("unexpected {other:?}"),
        }

        // terminal.open on an unreachable host resolves to a typed error
        let response = command::dispatch(
            &station,
            Command::TerminalOpen {
                node_id: "missing-node".to_string(),
                rows: 24,
                cols: 80,
            },
        )
        .await;
        match response {
            Response::Error { error } => assert_eq!(error.kind, ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    });

    // ---- dependent/refcount invariant (I3) ----
    assert!(
        station.check_refcount_invariant(),
        "dependent table and pool refcounts diverged"
    );
}
