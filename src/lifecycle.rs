use crate::SmrError;
use crate::abort::{AbortCoordinator, AbortReason};
use crate::config::BootstrapConfig;
use crate::retry::{PollPolicy, PollWait};
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Requesting,
    Pending,
    Running,
    Terminated,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub address: Option<String>,
    pub state: InstanceState,
}

impl Instance {
    pub fn running(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: Some(address.into()),
            state: InstanceState::Running,
        }
    }
}

/// Compute-node API. Cloud providers plug in here; the job only needs these three calls.
pub trait InstanceProvider: Send + Sync {
    fn request(&self, count: usize) -> Result<Vec<Instance>, SmrError>;
    /// Current view of one instance, used for readiness polling.
    fn describe(&self, id: &str) -> Result<Instance, SmrError>;
    fn terminate(&self, ids: &[String]) -> Result<(), SmrError>;
}

/// Pre-provisioned hosts that are always running. Terminating them is a no-op.
pub struct StaticHostProvider {
    hosts: Vec<String>,
}

impl StaticHostProvider {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }
}

impl InstanceProvider for StaticHostProvider {
    fn request(&self, count: usize) -> Result<Vec<Instance>, SmrError> {
        if count > self.hosts.len() {
            return Err(SmrError::Bootstrap(format!(
                "{} instances requested but only {} hosts available",
                count,
                self.hosts.len()
            )));
        }
        Ok(self.hosts[..count]
            .iter()
            .map(|host| Instance::running(host.clone(), host.clone()))
            .collect())
    }

    fn describe(&self, id: &str) -> Result<Instance, SmrError> {
        Ok(Instance::running(id, id))
    }

    fn terminate(&self, ids: &[String]) -> Result<(), SmrError> {
        info!(hosts = ?ids, "releasing static hosts");
        Ok(())
    }
}

/// Every instance is this machine.
#[derive(Debug, Default)]
pub struct LocalProvider;

impl InstanceProvider for LocalProvider {
    fn request(&self, count: usize) -> Result<Vec<Instance>, SmrError> {
        Ok((0..count)
            .map(|n| Instance::running(format!("local-{}", n), "localhost"))
            .collect())
    }

    fn describe(&self, id: &str) -> Result<Instance, SmrError> {
        Ok(Instance::running(id, "localhost"))
    }

    fn terminate(&self, _ids: &[String]) -> Result<(), SmrError> {
        Ok(())
    }
}

/// Brings instances up, bootstraps them, and tears them all down exactly once.
pub struct InstanceLifecycleManager {
    provider: Arc<dyn InstanceProvider>,
    transport: Arc<dyn Transport>,
    readiness: PollPolicy,
    instances: Mutex<Vec<Instance>>,
    terminated: AtomicBool,
}

impl InstanceLifecycleManager {
    pub fn new(
        provider: Arc<dyn InstanceProvider>,
        transport: Arc<dyn Transport>,
        readiness: PollPolicy,
    ) -> Self {
        Self {
            provider,
            transport,
            readiness,
            instances: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Instance>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, id: &str, state: InstanceState, address: Option<&str>) {
        if let Some(instance) = self.lock().iter_mut().find(|i| i.id == id) {
            instance.state = state;
            if let Some(address) = address {
                instance.address = Some(address.to_string());
            }
        }
    }

    /// Requests `count` instances and brings each up on its own thread.
    ///
    /// `on_ready` runs on the instance's thread as soon as that instance is running and
    /// bootstrapped, so sessions on early instances start while others are still coming
    /// up. Any failure triggers `BootstrapFailed`; the remaining instances stop at their
    /// next poll. Returns the instances that became ready.
    pub fn provision<F>(
        &self,
        count: usize,
        bootstrap: &BootstrapConfig,
        abort: &AbortCoordinator,
        on_ready: F,
    ) -> Result<Vec<Instance>, SmrError>
    where
        F: Fn(&Instance) + Sync,
    {
        let requested = match self.provider.request(count) {
            Ok(requested) => requested,
            Err(e) => {
                abort.trigger(AbortReason::BootstrapFailed(e.to_string()));
                return Err(e);
            }
        };
        info!(count = requested.len(), "requested instances");
        {
            let mut instances = self.lock();
            instances.extend(requested.iter().cloned());
        }
        if self.terminated.load(Ordering::SeqCst) {
            // terminate_all already ran before these existed
            let ids: Vec<String> = requested.iter().map(|i| i.id.clone()).collect();
            self.provider.terminate(&ids)?;
            return Err(SmrError::Aborted("instances terminated during provisioning".into()));
        }

        let ready: Vec<Instance> = std::thread::scope(|scope| {
            let workers: Vec<_> = requested
                .iter()
                .map(|instance| {
                    let on_ready = &on_ready;
                    scope.spawn(move || {
                        match self.bring_up(instance, bootstrap, abort) {
                            Ok(ready) => {
                                info!(instance = %ready.id, "instance initialized");
                                on_ready(&ready);
                                Some(ready)
                            }
                            Err(SmrError::Aborted(_)) => None,
                            Err(e) => {
                                error!(instance = %instance.id, error = %e, "instance failed to initialize");
                                self.set_state(&instance.id, InstanceState::Failed, None);
                                abort.trigger(AbortReason::BootstrapFailed(format!(
                                    "{}: {}",
                                    instance.id, e
                                )));
                                None
                            }
                        }
                    })
                })
                .collect();
            workers
                .into_iter()
                .filter_map(|worker| worker.join().ok().flatten())
                .collect()
        });

        if let Some(reason) = abort.reason() {
            return Err(SmrError::Aborted(reason.to_string()));
        }
        Ok(ready)
    }

    fn bring_up(
        &self,
        instance: &Instance,
        bootstrap: &BootstrapConfig,
        abort: &AbortCoordinator,
    ) -> Result<Instance, SmrError> {
        let ready = self.wait_until_running(&instance.id, abort)?;
        let address = ready
            .address
            .clone()
            .ok_or_else(|| SmrError::Bootstrap(format!("{} is running without an address", ready.id)))?;
        self.set_state(&ready.id, InstanceState::Running, Some(address.as_str()));
        self.wait_until_reachable(&ready.id, &address, abort)?;
        self.run_bootstrap(&ready.id, &address, bootstrap, abort)?;
        Ok(ready)
    }

    fn wait_until_running(&self, id: &str, abort: &AbortCoordinator) -> Result<Instance, SmrError> {
        let mut poller = self.readiness.poller();
        loop {
            let current = self.provider.describe(id)?;
            match current.state {
                InstanceState::Running if current.address.is_some() => return Ok(current),
                InstanceState::Failed | InstanceState::Terminated => {
                    return Err(SmrError::Bootstrap(format!(
                        "invalid state for {}: {:?}",
                        id, current.state
                    )));
                }
                state => {
                    self.set_state(id, state, None);
                    debug!(instance = id, ?state, "waiting for instance");
                }
            }
            match poller.wait(abort) {
                PollWait::Continue => {}
                PollWait::DeadlineExceeded => {
                    return Err(SmrError::Bootstrap(format!("{} did not start in time", id)));
                }
                PollWait::Aborted => return Err(SmrError::Aborted(id.to_string())),
            }
        }
    }

    fn wait_until_reachable(
        &self,
        id: &str,
        address: &str,
        abort: &AbortCoordinator,
    ) -> Result<(), SmrError> {
        let mut poller = self.readiness.poller();
        info!(instance = id, address, "waiting for connection");
        loop {
            match self.transport.probe(address) {
                Ok(()) => return Ok(()),
                Err(e) => debug!(instance = id, error = %e, "not reachable yet"),
            }
            match poller.wait(abort) {
                PollWait::Continue => {}
                PollWait::DeadlineExceeded => {
                    return Err(SmrError::Bootstrap(format!("{} ({}) never became reachable", id, address)));
                }
                PollWait::Aborted => return Err(SmrError::Aborted(id.to_string())),
            }
        }
    }

    fn run_bootstrap(
        &self,
        id: &str,
        address: &str,
        bootstrap: &BootstrapConfig,
        abort: &AbortCoordinator,
    ) -> Result<(), SmrError> {
        for command in &bootstrap.commands {
            if abort.is_aborted() {
                return Err(SmrError::Aborted(id.to_string()));
            }
            let output = self.transport.run(address, command)?;
            if output.code != 0 {
                return Err(SmrError::Bootstrap(format!(
                    "`{}` on {} exited with code {}",
                    command, id, output.code
                )));
            }
            info!(instance = id, command = command.as_str(), "bootstrap command succeeded");
        }
        for upload in &bootstrap.uploads {
            self.transport.upload(address, &upload.local, &upload.remote)?;
            debug!(instance = id, local = %upload.local.display(), remote = upload.remote.as_str(), "uploaded");
        }
        Ok(())
    }

    /// Terminates every known instance. Only the first call reaches the provider.
    ///
    /// Returns whether this call performed the termination.
    pub fn terminate_all(&self) -> Result<bool, SmrError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let ids: Vec<String> = {
            let mut instances = self.lock();
            let ids = instances
                .iter()
                .filter(|i| i.state != InstanceState::Terminated)
                .map(|i| i.id.clone())
                .collect();
            for instance in instances.iter_mut() {
                instance.state = InstanceState::Terminated;
            }
            ids
        };
        if ids.is_empty() {
            return Ok(true);
        }
        info!(instances = ?ids, "terminating instances");
        if let Err(e) = self.provider.terminate(&ids) {
            warn!(error = %e, "terminate request failed");
            return Err(e);
        }
        Ok(true)
    }
}
