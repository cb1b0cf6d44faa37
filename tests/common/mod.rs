#![allow(dead_code)]

use crossbeam_channel::{Receiver, Sender};
use smr::SmrError;
use smr::config::{JobConfig, TimingConfig};
use smr::job::Job;
use smr::lifecycle::{Instance, InstanceLifecycleManager, InstanceProvider, InstanceState};
use smr::reducer::ReducerSink;
use smr::retry::PollPolicy;
use smr::session::{RemoteProcess, SessionParts};
use smr::task_queue::WorkItem;
use smr::transport::{CommandOutput, Transport};
use std::collections::HashSet;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn items(n: usize) -> Vec<WorkItem> {
    (1..=n)
        .map(|i| WorkItem::new(format!("item-{}", i)).unwrap())
        .collect()
}

/// Config with short timeouts so tests finish quickly.
pub fn fast_config(instances: usize, workers_per_instance: usize) -> JobConfig {
    JobConfig {
        instances,
        workers_per_instance,
        map_command: "fake-map".into(),
        reduce_command: "fake-reduce".into(),
        readiness: PollPolicy {
            interval_ms: 10,
            max_interval_ms: None,
            deadline_secs: Some(1),
        },
        timing: TimingConfig {
            take_timeout_ms: 10,
            exit_poll_ms: 5,
            collector_poll_ms: 10,
            abort_grace_ms: 2000,
            progress_interval_ms: 50,
        },
        ..JobConfig::default()
    }
}

pub fn job(config: JobConfig, provider: Arc<FakeProvider>, transport: Arc<FakeTransport>) -> Job {
    let readiness = config.readiness.clone();
    Job::new(
        config,
        Arc::new(InstanceLifecycleManager::new(provider, transport, readiness)),
    )
}

// ---------- in-memory pipes ----------

pub struct ChannelWriter(Sender<Vec<u8>>);

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.0
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    pub fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            chunk: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

pub struct BrokenReader;

impl Read for BrokenReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        panic!("status stream corrupted");
    }
}

/// Write side held by the fake worker; taking it closes the stream for the reader.
type Outlet = Arc<Mutex<Option<Sender<Vec<u8>>>>>;

fn send(outlet: &Outlet, bytes: Vec<u8>) -> bool {
    match outlet.lock().unwrap().as_ref() {
        Some(tx) => tx.send(bytes).is_ok(),
        None => false,
    }
}

// ---------- fake workers ----------

pub enum Reply {
    /// Emit this result line and acknowledge.
    Succeed(String),
    Fail,
    /// Print a line that is not a status record, then acknowledge.
    Garbage(String),
}

/// Decides a worker's reply from `(address, item)`.
pub type Script = Arc<dyn Fn(&str, &str) -> Reply + Send + Sync>;

pub fn always_succeed() -> Script {
    Arc::new(|address, item| Reply::Succeed(format!("{} {}", address, item)))
}

#[derive(Default)]
pub struct WorkerLog {
    /// `(address, item)` in the order workers read their assignments.
    pub assigned: Mutex<Vec<(String, String)>>,
    /// Recorded just before the status line goes out.
    pub replied: Mutex<Vec<(String, String)>>,
}

impl WorkerLog {
    pub fn assigned_items(&self) -> Vec<String> {
        self.assigned.lock().unwrap().iter().map(|(_, i)| i.clone()).collect()
    }
}

struct FakeProcess {
    exit: Arc<Mutex<Option<i32>>>,
    status: Outlet,
    results: Outlet,
}

impl RemoteProcess for FakeProcess {
    fn try_exit(&mut self) -> io::Result<Option<i32>> {
        Ok(*self.exit.lock().unwrap())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.exit.lock().unwrap().get_or_insert(-1);
        self.status.lock().unwrap().take();
        self.results.lock().unwrap().take();
        Ok(())
    }
}

pub struct FakeTransport {
    pub script: Script,
    pub delay: Duration,
    /// Per-address override of `delay`.
    pub delays: Vec<(String, Duration)>,
    pub unreachable: HashSet<String>,
    pub exit_code: i32,
    /// Status streams panic on first read.
    pub broken_status: bool,
    pub log: Arc<WorkerLog>,
    pub launches: AtomicUsize,
}

impl FakeTransport {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            delay: Duration::ZERO,
            delays: Vec::new(),
            unreachable: HashSet::new(),
            exit_code: 0,
            broken_status: false,
            log: Arc::new(WorkerLog::default()),
            launches: AtomicUsize::new(0),
        }
    }

    fn delay_for(&self, address: &str) -> Duration {
        self.delays
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, d)| *d)
            .unwrap_or(self.delay)
    }
}

impl Transport for FakeTransport {
    fn probe(&self, address: &str) -> Result<(), SmrError> {
        if self.unreachable.contains(address) {
            Err(SmrError::Transport(format!("connection to {} refused", address)))
        } else {
            Ok(())
        }
    }

    fn launch(&self, address: &str, _command: &str) -> Result<SessionParts, SmrError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (assign_tx, assign_rx) = crossbeam_channel::unbounded();
        let (status_tx, status_rx) = crossbeam_channel::unbounded();
        let (results_tx, results_rx) = crossbeam_channel::unbounded();
        let status: Outlet = Arc::new(Mutex::new(Some(status_tx)));
        let results: Outlet = Arc::new(Mutex::new(Some(results_tx)));
        let exit = Arc::new(Mutex::new(None));

        let worker = FakeWorker {
            address: address.to_string(),
            script: Arc::clone(&self.script),
            delay: self.delay_for(address),
            exit_code: self.exit_code,
            log: Arc::clone(&self.log),
            status: Arc::clone(&status),
            results: Arc::clone(&results),
            exit: Arc::clone(&exit),
        };
        std::thread::spawn(move || worker.run(ChannelReader::new(assign_rx)));

        Ok(SessionParts {
            assignment: Box::new(ChannelWriter(assign_tx)),
            status: if self.broken_status {
                Box::new(BrokenReader)
            } else {
                Box::new(ChannelReader::new(status_rx))
            },
            results: Box::new(ChannelReader::new(results_rx)),
            process: Box::new(FakeProcess {
                exit,
                status,
                results,
            }),
        })
    }

    fn run(&self, _address: &str, _command: &str) -> Result<CommandOutput, SmrError> {
        Ok(CommandOutput {
            code: 0,
            stderr: Vec::new(),
        })
    }

    fn upload(&self, _address: &str, _local: &Path, _remote: &str) -> Result<(), SmrError> {
        Ok(())
    }
}

struct FakeWorker {
    address: String,
    script: Script,
    delay: Duration,
    exit_code: i32,
    log: Arc<WorkerLog>,
    status: Outlet,
    results: Outlet,
    exit: Arc<Mutex<Option<i32>>>,
}

impl FakeWorker {
    fn run(self, assignments: ChannelReader) {
        for line in BufReader::new(assignments).lines() {
            let Ok(item) = line else { break };
            self.log
                .assigned
                .lock()
                .unwrap()
                .push((self.address.clone(), item.clone()));
            std::thread::sleep(self.delay);
            let status = match (self.script)(&self.address, &item) {
                Reply::Succeed(result) => {
                    send(&self.results, format!("{}\n", result).into_bytes());
                    format!("+{}\n", item)
                }
                Reply::Fail => format!("!{}\n", item),
                Reply::Garbage(text) => {
                    send(&self.status, format!("{}\n", text).into_bytes());
                    format!("+{}\n", item)
                }
            };
            self.log
                .replied
                .lock()
                .unwrap()
                .push((self.address.clone(), item));
            if !send(&self.status, status.into_bytes()) {
                break;
            }
        }
        self.exit.lock().unwrap().get_or_insert(self.exit_code);
        self.status.lock().unwrap().take();
        self.results.lock().unwrap().take();
    }
}

// ---------- fake provider ----------

#[derive(Default)]
pub struct FakeProvider {
    /// Instances that never leave `Pending`.
    pub pending: HashSet<String>,
    pub terminate_calls: AtomicUsize,
    pub terminated: Mutex<Vec<String>>,
}

impl InstanceProvider for FakeProvider {
    fn request(&self, count: usize) -> Result<Vec<Instance>, SmrError> {
        Ok((0..count)
            .map(|n| Instance {
                id: format!("node-{}", n),
                address: None,
                state: InstanceState::Requesting,
            })
            .collect())
    }

    fn describe(&self, id: &str) -> Result<Instance, SmrError> {
        if self.pending.contains(id) {
            return Ok(Instance {
                id: id.to_string(),
                address: None,
                state: InstanceState::Pending,
            });
        }
        Ok(Instance::running(id, id))
    }

    fn terminate(&self, ids: &[String]) -> Result<(), SmrError> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        self.terminated.lock().unwrap().extend(ids.iter().cloned());
        Ok(())
    }
}

// ---------- fake reducer ----------

#[derive(Clone, Default)]
pub struct SinkProbe {
    pub entries: Arc<Mutex<Vec<Vec<u8>>>>,
    pub killed: Arc<AtomicBool>,
    pub closed: Arc<AtomicBool>,
}

impl SinkProbe {
    pub fn lines(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| String::from_utf8_lossy(e).trim_end().to_string())
            .collect()
    }
}

pub struct FakeSink {
    probe: SinkProbe,
    /// `(entries, code)`: terminate with `code` once this many entries were written.
    exit_after: Option<(usize, i32)>,
}

impl FakeSink {
    pub fn new() -> (Self, SinkProbe) {
        Self::exiting_after(None)
    }

    pub fn exiting_after(exit_after: Option<(usize, i32)>) -> (Self, SinkProbe) {
        let probe = SinkProbe::default();
        (
            Self {
                probe: probe.clone(),
                exit_after,
            },
            probe,
        )
    }

    pub fn boxed(self) -> Result<Box<dyn ReducerSink>, SmrError> {
        Ok(Box::new(self))
    }

    fn exited(&self) -> Option<i32> {
        let written = self.probe.entries.lock().unwrap().len();
        self.exit_after
            .filter(|(limit, _)| written >= *limit)
            .map(|(_, code)| code)
    }
}

impl ReducerSink for FakeSink {
    fn write_entry(&mut self, entry: &[u8]) -> io::Result<()> {
        if self.exited().is_some() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "reducer gone"));
        }
        self.probe.entries.lock().unwrap().push(entry.to_vec());
        Ok(())
    }

    fn try_exit(&mut self) -> io::Result<Option<i32>> {
        Ok(self.exited())
    }

    fn close_input(&mut self) {
        self.probe.closed.store(true, Ordering::SeqCst);
    }

    fn wait(&mut self) -> io::Result<i32> {
        Ok(self.exited().unwrap_or(0))
    }

    fn kill(&mut self) {
        self.probe.killed.store(true, Ordering::SeqCst);
    }
}
