//! Simulated workload fleet.
//!
//! Runs each workload node in its own thread, driven over a bounded command
//! channel. Between commands the worker keeps writing sequential operations
//! to its key and logs every attempt in the workload log format.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use super::cluster::{ProduceOutcome, SimCluster};
use crate::chaos::config::ExperimentRecord;
use crate::cluster::{Node, Resource};
use crate::error::{HarnessError, Result};
use crate::oracle::log::{format_line, State};
use crate::workload::{PhaseEvent, WorkloadFleet, WorkloadInfo};

/// Commands that can be sent to a worker thread.
#[derive(Debug)]
enum WorkerCommand {
    Event(PhaseEvent),
    Info(Sender<WorkloadInfo>),
    Stop,
}

/// Handle to a running worker thread.
struct WorkerHandle {
    node: Node,
    command_tx: Sender<WorkerCommand>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    lines: Arc<Mutex<Vec<String>>>,
    killed: Arc<AtomicBool>,
}

impl WorkerHandle {
    fn info(&self) -> Result<WorkloadInfo> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(HarnessError::infra(format!("workload on {} is dead", self.node.ip)));
        }
        let (resp_tx, resp_rx) = bounded(1);
        self.command_tx
            .send(WorkerCommand::Info(resp_tx))
            .map_err(|_| HarnessError::infra(format!("workload on {} is gone", self.node.ip)))?;
        resp_rx
            .recv_timeout(Duration::from_secs(1))
            .map_err(|_| HarnessError::timeout(format!("info from {}", self.node.ip), Duration::from_secs(1)))
    }

    /// Stop the worker thread and wait for it.
    fn stop(&self) {
        let _ = self.command_tx.send(WorkerCommand::Stop);
        let handle = self.thread_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.stop();
    }
}

/// The worker that executes in its own thread.
struct Worker {
    thread_id: u64,
    key: String,
    resource: Resource,
    cluster: Arc<SimCluster>,
    op_interval: Duration,
    command_rx: Receiver<WorkerCommand>,
    killed: Arc<AtomicBool>,
    lines: Arc<Mutex<Vec<String>>>,
    last_us: Option<i64>,
    next_op: u64,
    succeeded_ops: u64,
}

impl Worker {
    fn run(&mut self) {
        let key = self.key.clone();
        self.log(State::Started, &[&key]);
        while !self.killed.load(Ordering::SeqCst) {
            match self.command_rx.recv_timeout(self.op_interval) {
                Ok(WorkerCommand::Event(event)) => self.log(State::Event, &[event.as_str()]),
                Ok(WorkerCommand::Info(resp_tx)) => {
                    let _ = resp_tx.send(WorkloadInfo {
                        succeeded_ops: self.succeeded_ops,
                    });
                }
                Ok(WorkerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => self.write_once(),
            }
        }
    }

    fn write_once(&mut self) {
        self.next_op += 1;
        let op = self.next_op;
        self.log(State::Sending, &[&op.to_string()]);
        match self.cluster.produce(&self.resource, &self.key, op) {
            ProduceOutcome::Committed(offset) => {
                self.succeeded_ops += 1;
                self.log(State::Ok, &[&offset.to_string()]);
            }
            ProduceOutcome::Rejected(reason) => self.log(State::Error, &[&reason]),
            ProduceOutcome::TimedOut => self.log(State::Timeout, &[]),
        }
    }

    fn log(&mut self, state: State, args: &[&str]) {
        let now = chrono::Utc::now().timestamp_micros();
        let delta = match self.last_us {
            None => now,
            Some(last) => now - last,
        };
        self.last_us = Some(now);
        self.lines.lock().push(format_line(self.thread_id, delta, state, args));
    }
}

fn spawn_worker(
    node: Node,
    cluster: Arc<SimCluster>,
    resource: Resource,
    op_interval: Duration,
) -> WorkerHandle {
    let (command_tx, command_rx) = bounded(100);
    let lines = Arc::new(Mutex::new(Vec::new()));
    let killed = Arc::new(AtomicBool::new(false));

    let mut worker = Worker {
        thread_id: node.id as u64,
        key: format!("key-{}", node.id),
        resource,
        cluster,
        op_interval,
        command_rx,
        killed: killed.clone(),
        lines: lines.clone(),
        last_us: None,
        next_op: 0,
        succeeded_ops: 0,
    };
    let thread_handle = thread::spawn(move || worker.run());

    WorkerHandle {
        node,
        command_tx,
        thread_handle: Mutex::new(Some(thread_handle)),
        lines,
        killed,
    }
}

pub struct SimFleet {
    workers: Vec<WorkerHandle>,
    log_fetches: AtomicU32,
}

impl SimFleet {
    /// Start `size` workload nodes writing to `topic` every `op_interval`.
    pub fn start(cluster: Arc<SimCluster>, size: u32, topic: &str, op_interval: Duration) -> Self {
        let workers = (0..size)
            .map(|id| {
                let node = Node::new(id, format!("10.0.1.{}", id + 1));
                spawn_worker(node, cluster.clone(), Resource::topic(topic), op_interval)
            })
            .collect();
        SimFleet {
            workers,
            log_fetches: AtomicU32::new(0),
        }
    }

    fn worker(&self, node: &Node) -> Result<&WorkerHandle> {
        self.workers
            .iter()
            .find(|w| w.node.id == node.id)
            .ok_or_else(|| HarnessError::infra(format!("no workload on {}", node.ip)))
    }

    pub fn log_fetches(&self) -> u32 {
        self.log_fetches.load(Ordering::SeqCst)
    }

    fn count_ops(&self) -> BTreeMap<String, u64> {
        self.workers
            .iter()
            .map(|w| {
                let acked = w.lines.lock().iter().filter(|l| l.split('\t').nth(2) == Some("ok")).count();
                (w.node.ip.clone(), acked as u64)
            })
            .collect()
    }
}

impl WorkloadFleet for SimFleet {
    fn nodes(&self) -> Vec<Node> {
        self.workers.iter().map(|w| w.node.clone()).collect()
    }

    fn emit_event(&self, node: &Node, event: PhaseEvent) -> Result<()> {
        self.worker(node)?
            .command_tx
            .try_send(WorkerCommand::Event(event))
            .map_err(|e| HarnessError::infra(format!("can't notify {}: {}", node.ip, e)))
    }

    fn info(&self, node: &Node) -> Result<WorkloadInfo> {
        self.worker(node)?.info()
    }

    fn stop_everywhere(&self) -> Result<()> {
        for worker in &self.workers {
            worker.stop();
        }
        Ok(())
    }

    fn kill_everywhere(&self) -> Result<()> {
        for worker in &self.workers {
            worker.kill();
        }
        Ok(())
    }

    fn wait_killed(&self, timeout: Duration) -> Result<()> {
        let alive = self.workers.iter().filter(|w| w.thread_handle.lock().is_some()).count();
        if alive == 0 {
            Ok(())
        } else {
            Err(HarnessError::timeout(format!("{} workload nodes still running", alive), timeout))
        }
    }

    fn fetch_log(&self, node: &Node, dest: &Path) -> Result<()> {
        let worker = self.worker(node)?;
        self.log_fetches.fetch_add(1, Ordering::SeqCst);
        let mut text = worker.lines.lock().join("\n");
        text.push('\n');
        fs::write(dest.join("workload.log"), text)?;
        debug!(target: "chaos", "fetched workload log of {}", node.ip);
        Ok(())
    }

    fn analyze(&self, mut record: ExperimentRecord) -> Result<ExperimentRecord> {
        record.extra.insert(
            "acknowledged_writes".to_string(),
            json!(self.count_ops()),
        );
        Ok(record)
    }
}

impl Drop for SimFleet {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.kill();
        }
    }
}
