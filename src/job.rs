use crate::SmrError;
use crate::abort::{AbortCoordinator, AbortReason};
use crate::collector::{CollectorReport, ResultCollector};
use crate::config::JobConfig;
use crate::context::JobContext;
use crate::lifecycle::{Instance, InstanceLifecycleManager};
use crate::progress::{ProgressReporter, ProgressSnapshot};
use crate::pump::{ProtocolPump, SessionReport};
use crate::reducer::ReducerSink;
use crate::session::{SessionHandle, WorkerSession};
use crate::task_queue::WorkItem;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const SUPERVISE_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every item was acknowledged and the reducer exited cleanly.
    Complete,
    /// The job ran to the end but some items were abandoned by the retry policy.
    Partial,
    Aborted(AbortReason),
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Complete => write!(f, "complete"),
            JobOutcome::Partial => write!(f, "partial"),
            JobOutcome::Aborted(reason) => write!(f, "aborted ({})", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub outcome: JobOutcome,
    pub total: usize,
    pub processed: usize,
    pub abandoned: usize,
    pub output: Option<PathBuf>,
    pub elapsed: Duration,
    pub sessions: Vec<SessionReport>,
    pub collector: CollectorReport,
    pub progress: ProgressSnapshot,
}

impl JobReport {
    pub fn is_complete(&self) -> bool {
        self.outcome == JobOutcome::Complete
    }
}

struct Launched {
    handles: Vec<SessionHandle>,
    pumps: Vec<JoinHandle<()>>,
}

/// Runs one job: provisions instances, pumps items through worker sessions, and feeds
/// every result to the reducer until the job completes or aborts.
pub struct Job {
    config: JobConfig,
    lifecycle: Arc<InstanceLifecycleManager>,
    output: Option<PathBuf>,
}

impl Job {
    pub fn new(config: JobConfig, lifecycle: Arc<InstanceLifecycleManager>) -> Self {
        Self {
            config,
            lifecycle,
            output: None,
        }
    }

    /// Where the reducer writes; only reported back, the reducer owns the file.
    pub fn with_output(mut self, output: PathBuf) -> Self {
        self.output = Some(output);
        self
    }

    pub fn lifecycle(&self) -> &Arc<InstanceLifecycleManager> {
        &self.lifecycle
    }

    pub fn run<F>(
        &self,
        items: Vec<WorkItem>,
        launch_reducer: F,
        abort: Arc<AbortCoordinator>,
    ) -> Result<JobReport, SmrError>
    where
        F: FnOnce() -> Result<Box<dyn ReducerSink>, SmrError>,
    {
        let started = Instant::now();
        let ctx = Arc::new(JobContext::new(
            items,
            self.config.retry.clone(),
            self.config.timing.clone(),
            Arc::clone(&abort),
        )?);
        info!(
            items = ctx.queue.total(),
            instances = self.config.instances,
            sessions = self.config.total_sessions(),
            "starting job"
        );

        let sink = launch_reducer()?;
        let collector =
            ResultCollector::start(sink, Arc::clone(&abort), self.config.timing.collector_poll())?;
        let reporter = ProgressReporter::spawn(
            ctx.progress.clone_handle(),
            Arc::clone(&abort),
            self.config.timing.progress_interval(),
        )?;

        let (done, reports) = crossbeam_channel::unbounded();
        let launched = Mutex::new(Launched {
            handles: Vec::new(),
            pumps: Vec::new(),
        });
        // provisioning runs beside supervision so failures on ready instances are
        // escalated while others are still coming up
        let sessions = std::thread::scope(|scope| {
            let (ctx, collector, launched) = (&ctx, &collector, &launched);
            let provisioning = scope.spawn(move || {
                let provisioned = self.lifecycle.provision(
                    self.config.instances,
                    &self.config.bootstrap,
                    &ctx.abort,
                    |instance| self.start_sessions(instance, ctx, collector, &done, launched),
                );
                if let Err(e) = provisioned {
                    error!(error = %e, "provisioning did not complete");
                }
            });
            let sessions = self.supervise(&reports, &ctx.abort, launched);
            if provisioning.join().is_err() {
                ctx.abort.trigger(AbortReason::BootstrapFailed(
                    "provisioning thread panicked".to_string(),
                ));
            }
            sessions
        });

        let Launched { handles, pumps } =
            launched.into_inner().unwrap_or_else(PoisonError::into_inner);
        for pump in pumps {
            let name = pump.thread().name().unwrap_or("pump").to_string();
            if pump.join().is_err() {
                error!(thread = %name, "pump thread panicked");
                abort.trigger(AbortReason::SessionFailed(format!("{} panicked", name)));
            }
        }
        if !abort.is_aborted() && !ctx.queue.is_exhausted() {
            abort.trigger(AbortReason::SessionFailed(format!(
                "all workers finished with {} of {} items unsettled",
                ctx.queue.total() - ctx.queue.settled(),
                ctx.queue.total()
            )));
        }
        // sessions must be closed so their result readers reach end of stream
        close_all(&handles);

        if let Err(e) = self.lifecycle.terminate_all() {
            warn!(error = %e, "could not terminate instances");
        }

        let (mut sink, collected) = collector.finish();
        if abort
            .reason()
            .is_some_and(|reason| reason.skips_final_flush())
        {
            sink.kill();
        } else {
            match sink.wait() {
                Ok(0) => {}
                Ok(code) => {
                    abort.trigger(AbortReason::ReducerFailed(format!(
                        "reducer exited with code {}",
                        code
                    )));
                }
                Err(e) => {
                    abort.trigger(AbortReason::ReducerFailed(e.to_string()));
                }
            }
        }
        reporter.stop();

        let outcome = match abort.reason() {
            Some(reason) => JobOutcome::Aborted(reason),
            None if ctx.queue.abandoned() > 0 => JobOutcome::Partial,
            None => JobOutcome::Complete,
        };
        let report = JobReport {
            outcome,
            total: ctx.queue.total(),
            processed: ctx.progress.processed(),
            abandoned: ctx.queue.abandoned(),
            output: self.output.clone(),
            elapsed: started.elapsed(),
            sessions,
            collector: collected,
            progress: ctx.progress.snapshot(),
        };
        info!(
            outcome = %report.outcome,
            processed = report.processed,
            total = report.total,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "job finished"
        );
        Ok(report)
    }

    /// Collects pump reports until provisioning is over and every pump has reported.
    ///
    /// Failed sessions trigger the abort. Once aborted, sessions still running are
    /// force-closed after the grace period, including any started after the abort.
    fn supervise(
        &self,
        reports: &Receiver<SessionReport>,
        abort: &AbortCoordinator,
        launched: &Mutex<Launched>,
    ) -> Vec<SessionReport> {
        let mut sessions = Vec::new();
        let mut abort_seen: Option<Instant> = None;
        let mut closing = false;
        loop {
            match reports.recv_timeout(SUPERVISE_TICK) {
                Ok(report) => {
                    if !abort.is_aborted() {
                        if let Err(e) = report.check() {
                            abort.trigger(AbortReason::SessionFailed(e.to_string()));
                        }
                    }
                    sessions.push(report);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return sessions,
            }
            if let Some(reason) = abort.reason() {
                let since = *abort_seen.get_or_insert_with(Instant::now);
                let grace = if reason.skips_final_flush() {
                    Duration::ZERO
                } else {
                    self.config.timing.abort_grace()
                };
                if since.elapsed() >= grace {
                    let launched = launched.lock().unwrap_or_else(PoisonError::into_inner);
                    if !closing {
                        info!(sessions = launched.handles.len(), "closing worker sessions");
                        closing = true;
                    }
                    close_all(&launched.handles);
                }
            }
        }
    }

    /// Launches this instance's workers and starts one pump thread per session.
    fn start_sessions(
        &self,
        instance: &Instance,
        ctx: &Arc<JobContext>,
        collector: &ResultCollector,
        done: &Sender<SessionReport>,
        launched: &Mutex<Launched>,
    ) {
        let Some(address) = instance.address.as_deref() else {
            ctx.abort.trigger(AbortReason::SessionFailed(format!(
                "{} has no address",
                instance.id
            )));
            return;
        };
        for n in 0..self.config.workers_per_instance {
            if ctx.abort.is_aborted() {
                return;
            }
            let label = format!("{}#{}", instance.id, n);
            let parts = match self
                .lifecycle
                .transport()
                .launch(address, &self.config.map_command)
            {
                Ok(parts) => parts,
                Err(e) => {
                    ctx.abort.trigger(AbortReason::SessionFailed(format!(
                        "could not start worker {}: {}",
                        label, e
                    )));
                    return;
                }
            };
            let mut session = WorkerSession::new(label.as_str(), parts);
            if let Some(results) = session.take_results() {
                if let Err(e) = collector.attach(&label, results) {
                    ctx.abort.trigger(AbortReason::SessionFailed(format!("{}: {}", label, e)));
                    session.release();
                    return;
                }
            }
            let handle = session.handle();
            let pump = ProtocolPump::new(session, Arc::clone(ctx));
            let done = done.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("pump-{}", label))
                .spawn(move || {
                    let _ = done.send(pump.run());
                });
            match spawned {
                Ok(join) => {
                    info!(session = %label, "worker session started");
                    let mut launched = launched.lock().unwrap_or_else(PoisonError::into_inner);
                    launched.handles.push(handle);
                    launched.pumps.push(join);
                }
                Err(e) => {
                    handle.force_close();
                    ctx.abort.trigger(AbortReason::SessionFailed(format!("{}: {}", label, e)));
                    return;
                }
            }
        }
    }
}

fn close_all(handles: &[SessionHandle]) {
    for handle in handles {
        handle.force_close();
    }
}
