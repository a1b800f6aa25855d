//! Lightweight remote resource sampling over the shared transport.
//! One sampler per node; each tick runs a short command over an exec
//! channel and publishes the parsed figures as a `profiler.sample`
//! event.  The sampler is an ordinary dependent: suspended on
//! link-down, restarted on restore.

use crate::config::CoreConfig;
use crate::dependents::{DependentKey, DependentKind, DependentState};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::node::NodeId;
use crate::pool::ConnectionState;
use crate::{Station, StationNotification};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol::Timer;
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type ProfilerId = usize;

static PROFILER_ID: AtomicUsize = AtomicUsize::new(1);

const SAMPLE_COMMAND: &str = "cat /proc/loadavg; grep -E 'MemTotal|MemAvailable' /proc/meminfo";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilerSample {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub mem_total_kb: u64,
    pub mem_available_kb: u64,
    pub timestamp_ms: u64,
}

pub struct ProfilerRecord {
    pub profiler_id: ProfilerId,
    pub node_id: NodeId,
    suspended: AtomicBool,
    stopped: AtomicBool,
}

pub struct ProfilerRegistry {
    profilers: RwLock<HashMap<ProfilerId, Arc<ProfilerRecord>>>,
    interval: Duration,
}

impl ProfilerRegistry {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            profilers: RwLock::new(HashMap::new()),
            interval: config.profiler_interval(),
        }
    }

    pub fn for_node(&self, node_id: &str) -> Vec<Arc<ProfilerRecord>> {
        self.profilers
            .read()
            .values()
            .filter(|p| p.node_id == node_id)
            .map(Arc::clone)
            .collect()
    }

    pub async fn start(&self, station: &Arc<Station>, node_id: &str) -> CoreResult<ProfilerId> {
        if !self.for_node(node_id).is_empty() {
            return Err(CoreError::new(
                ErrorKind::AlreadyExists,
                format!("node {node_id} already has a profiler"),
            ));
        }
        station.resolve_connection(node_id).await?;

        let record = Arc::new(ProfilerRecord {
            profiler_id: PROFILER_ID.fetch_add(1, Ordering::Relaxed),
            node_id: node_id.to_string(),
            suspended: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });
        self.profilers
            .write()
            .insert(record.profiler_id, Arc::clone(&record));
        station.register_dependent(
            DependentKey::new(DependentKind::Profiler, record.profiler_id),
            node_id,
        )?;

        let interval = self.interval;
        let task_record = Arc::clone(&record);
        let task_station = Arc::clone(station);
        smol::spawn(async move {
            sample_loop(task_station, task_record, interval).await;
        })
        .detach();

        Ok(record.profiler_id)
    }

    pub fn stop(&self, station: &Arc<Station>, profiler_id: ProfilerId) -> CoreResult<()> {
        let record = self
            .profilers
            .write()
            .remove(&profiler_id)
            .ok_or_else(|| CoreError::not_found(format!("profiler {profiler_id}")))?;
        record.stopped.store(true, Ordering::SeqCst);
        station.unregister_dependent(&DependentKey::new(DependentKind::Profiler, profiler_id));
        Ok(())
    }

    pub fn suspend_node(&self, station: &Arc<Station>, node_id: &str) {
        for record in self.for_node(node_id) {
            record.suspended.store(true, Ordering::SeqCst);
            station.dependents.lock().set_state(
                &DependentKey::new(DependentKind::Profiler, record.profiler_id),
                DependentState::Suspended,
            );
        }
    }

    pub fn restore_node(&self, station: &Arc<Station>, node_id: &str) {
        for record in self.for_node(node_id) {
            record.suspended.store(false, Ordering::SeqCst);
            station.dependents.lock().set_state(
                &DependentKey::new(DependentKind::Profiler, record.profiler_id),
                DependentState::Active,
            );
        }
    }

    pub fn stop_all(&self) {
        for record in self.profilers.write().drain() {
            record.1.stopped.store(true, Ordering::SeqCst);
        }
    }
}

async fn sample_loop(station: Arc<Station>, record: Arc<ProfilerRecord>, interval: Duration) {
    loop {
        Timer::after(interval).await;
        if record.stopped.load(Ordering::SeqCst) {
            break;
        }
        if record.suspended.load(Ordering::SeqCst) {
            continue;
        }

        match sample_once(&station, &record.node_id).await {
            Ok(sample) => {
                station.notify(StationNotification::ProfilerSample {
                    node_id: record.node_id.clone(),
                    sample,
                });
            }
            Err(err) => {
                // Transport trouble is the pool's problem to detect;
                // the sampler just sits the tick out.
                log::trace!("profiler for {}: {}", record.node_id, err);
            }
        }
    }
    log::trace!("profiler for {} retired", record.node_id);
}

async fn sample_once(station: &Arc<Station>, node_id: &str) -> CoreResult<ProfilerSample> {
    let connection_id = station
        .node_connection(node_id)
        .ok_or_else(|| CoreError::new(ErrorKind::NotFound, "node is not connected"))?;
    let record = station
        .pool
        .get(connection_id)
        .ok_or_else(|| CoreError::not_found("connection"))?;
    if record.state() != ConnectionState::Active {
        return Err(CoreError::new(ErrorKind::BusyRetryLater, "connection not active"));
    }

    let streams = record
        .session
        .run(SAMPLE_COMMAND, None)
        .await
        .map_err(CoreError::internal)?;

    let mut out = streams.io;
    let output = smol::unblock(move || {
        let mut buf = String::new();
        out.read_to_string(&mut buf).ok();
        buf
    })
    .await;

    parse_sample(&output).ok_or_else(|| {
        CoreError::new(
            ErrorKind::Unsupported,
            format!("unparseable sample output from {node_id}"),
        )
    })
}

/// Parse the combined loadavg + meminfo output.
fn parse_sample(output: &str) -> Option<ProfilerSample> {
    let mut lines = output.lines();
    let loadavg = lines.next()?;
    let mut parts = loadavg.split_whitespace();
    let load1 = parts.next()?.parse().ok()?;
    let load5 = parts.next()?.parse().ok()?;
    let load15 = parts.next()?.parse().ok()?;

    let mut mem_total_kb = 0;
    let mut mem_available_kb = 0;
    for line in lines {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("MemTotal:") => mem_total_kb = fields.next()?.parse().ok()?,
            Some("MemAvailable:") => mem_available_kb = fields.next()?.parse().ok()?,
            _ => {}
        }
    }
    if mem_total_kb == 0 {
        return None;
    }

    Some(ProfilerSample {
        load1,
        load5,
        load15,
        mem_total_kb,
        mem_available_kb,
        timestamp_ms: crate::epoch_millis(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_typical_output() {
        let output = "0.52 0.58 0.59 1/389 12345\n\
                      MemTotal:       16384256 kB\n\
                      MemAvailable:   10240128 kB\n";
        let sample = parse_sample(output).unwrap();
        assert!((sample.load1 - 0.52).abs() < f64::EPSILON);
        assert!((sample.load15 - 0.59).abs() < f64::EPSILON);
        assert_eq!(sample.mem_total_kb, 16384256);
        assert_eq!(sample.mem_available_kb, 10240128);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_sample("").is_none());
        assert!(parse_sample("not a loadavg line\n").is_none());
    }
}
