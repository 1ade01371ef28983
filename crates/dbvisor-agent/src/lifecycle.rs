//! Instance state machine: create → install → start → stop → delete.
//!
//! Every host interaction goes through [`HostServices`] so the sequencing
//! can be driven against fakes.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use dbvisor_instance::{
    EngineKind, Instance, InstanceStatus, InstanceSummary, PortAssignments, PortRole,
};

use crate::{
    config::AgentConfig,
    diagnostics::{append_error_log, format_error_chain},
    engine::{InstanceLayout, descriptor},
    error::{LifecycleError, Result},
    health::{HealthProbe, HttpHealthProbe},
    host_lock::HostLock,
    installer,
    launcher::{GraphAction, Launcher, SignalError, StopSignal, SystemLauncher},
    port_alloc::{PortAllocator, PortProbe, SystemPorts},
    process_table::{
        ProcessTable, Signature, SystemProcessTable, discover_new_pid, live_pids,
        matching_pids, wait_until_gone,
    },
    store::{InstanceStore, normalize_name},
};

const REGISTRY_LOCK: &str = "registry.lock";
const DISCOVERY_LOCK: &str = "graph-discovery.lock";

/// The host seams the controller talks through.
#[derive(Clone)]
pub struct HostServices {
    pub ports: Arc<dyn PortProbe>,
    pub processes: Arc<dyn ProcessTable>,
    pub launcher: Arc<dyn Launcher>,
    pub health: Arc<dyn HealthProbe>,
}

impl HostServices {
    pub fn system(config: &AgentConfig) -> anyhow::Result<Self> {
        let host = config.probe.resolve_host();
        tracing::debug!(probe_host = %host, "health probe host resolved");
        Ok(Self {
            ports: Arc::new(SystemPorts),
            processes: Arc::new(SystemProcessTable::new()),
            launcher: Arc::new(SystemLauncher),
            health: Arc::new(HttpHealthProbe::new(host)?),
        })
    }
}

/// Result of [`LifecycleController::start`] for the expected failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Refused: the instance is running or still has a recorded pid.
    AlreadyRunning,
    /// The graph engine never showed up in the process table. Pids captured
    /// so far stay recorded; see `recover`.
    DiscoveryTimedOut,
    /// Launching failed; the message was appended to the instance's error log.
    Failed(String),
}

impl StartOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, StartOutcome::Started)
    }
}

pub struct LifecycleController {
    config: AgentConfig,
    host: HostServices,
    store: InstanceStore,
}

impl LifecycleController {
    pub fn new(config: AgentConfig, host: HostServices) -> Self {
        let store = InstanceStore::new(config.registry_dir());
        Self {
            config,
            host,
            store,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn layout(&self, name: &str) -> InstanceLayout {
        InstanceLayout::new(&self.config.instances_root(), name)
    }

    async fn load(&self, name: &str) -> Result<Instance> {
        let name = normalize_name(name)?;
        self.store.load(&name).await
    }

    pub async fn instance(&self, name: &str) -> Result<Instance> {
        self.load(name).await
    }

    /// Allocates eight host-unique ports and persists a Stopped record.
    /// Nothing is installed.
    pub async fn create(&self, name: &str) -> Result<Instance> {
        self.create_with_ports(name, PortAssignments::default()).await
    }

    /// Like [`create`](Self::create), but keeps the caller's ports for the
    /// roles in `preset`. A preset port already assigned to another instance,
    /// repeated within `preset`, or bound on the host is refused.
    pub async fn create_with_ports(&self, name: &str, preset: PortAssignments) -> Result<Instance> {
        let name = normalize_name(name)?;
        let _lock = HostLock::acquire(&self.config.locks_dir().join(REGISTRY_LOCK)).await?;

        if self.store.exists(&name).await {
            return Err(LifecycleError::AlreadyExists(name));
        }

        let mut taken = self.bound_ports().await?;
        for other in self.store.list().await? {
            taken.extend(other.ports.values());
        }

        let mut seen = BTreeSet::new();
        for (role, port) in preset.iter() {
            if port == 0 || taken.contains(&port) || !seen.insert(port) {
                return Err(LifecycleError::PortTaken {
                    instance: name.clone(),
                    role,
                    port,
                });
            }
        }

        let mut inst = Instance::new(&name);
        inst.ports = preset;
        let mut alloc = PortAllocator::new(
            EngineKind::ALL.map(|k| (k, self.config.base_port(k))),
            taken,
        );
        alloc
            .fill(&mut inst.ports)
            .map_err(|e| LifecycleError::PortsExhausted(format!("{} ({})", name, e.0)))?;

        self.store.save(&inst).await?;
        tracing::info!(instance = %name, ports = ?inst.ports.to_map(), "instance created");
        Ok(inst)
    }

    async fn bound_ports(&self) -> Result<BTreeSet<u16>> {
        let ports = Arc::clone(&self.host.ports);
        let bound = tokio::task::spawn_blocking(move || ports.bound_ports())
            .await
            .context("join host port scan")?;
        Ok(bound)
    }

    /// Installs the engines unless a complete install is already present.
    /// Returns whether an install ran.
    pub async fn ensure_installed(&self, name: &str) -> Result<bool> {
        let inst = self.load(name).await?;
        let layout = self.layout(&inst.name);
        if layout.is_installed() {
            return Ok(false);
        }
        self.install_instance(&inst, &layout).await?;
        Ok(true)
    }

    /// Wipes the instance directory and installs both engines from scratch.
    pub async fn install(&self, name: &str) -> Result<()> {
        let inst = self.load(name).await?;
        if inst.status == InstanceStatus::Running || inst.has_any_pid() {
            return Err(anyhow::anyhow!(
                "instance {} has running engines; stop or recover it before reinstalling",
                inst.name
            )
            .into());
        }
        let layout = self.layout(&inst.name);
        self.install_instance(&inst, &layout).await
    }

    async fn install_instance(&self, inst: &Instance, layout: &InstanceLayout) -> Result<()> {
        if let Some(role) = inst.ports.missing().next() {
            return Err(LifecycleError::PortMissing(inst.name.clone(), role));
        }
        tracing::info!(instance = %inst.name, dir = %layout.dir().display(), "installing engines");
        installer::install(&self.config, inst, layout).await?;
        tracing::info!(instance = %inst.name, "install complete");
        Ok(())
    }

    /// Every assigned port must be free before anything is launched.
    async fn preflight(&self, inst: &Instance) -> Result<()> {
        let mut assigned = Vec::with_capacity(PortRole::ALL.len());
        for role in PortRole::ALL {
            let Some(port) = inst.ports.get(role) else {
                return Err(LifecycleError::PortMissing(inst.name.clone(), role));
            };
            assigned.push((role, port));
        }

        let ports = Arc::clone(&self.host.ports);
        let conflict = tokio::task::spawn_blocking(move || {
            assigned.into_iter().find(|&(_, port)| ports.in_use(port))
        })
        .await
        .context("join port preflight")?;

        match conflict {
            Some((role, port)) => Err(LifecycleError::PortConflict {
                instance: inst.name.clone(),
                role,
                port,
            }),
            None => Ok(()),
        }
    }

    /// Launches both engines and waits for them to answer.
    ///
    /// Port conflicts and a post-discovery health timeout are errors; other
    /// launch failures are written to `error.log` and reported as
    /// [`StartOutcome::Failed`].
    pub async fn start(&self, name: &str, timeout: Option<Duration>) -> Result<StartOutcome> {
        let mut inst = self.load(name).await?;
        if inst.status == InstanceStatus::Running || inst.has_any_pid() {
            tracing::warn!(
                instance = %inst.name,
                status = ?inst.status,
                graph_pid = ?inst.graph_pid,
                timeseries_pid = ?inst.timeseries_pid,
                "start refused: instance already running"
            );
            return Ok(StartOutcome::AlreadyRunning);
        }

        let layout = self.layout(&inst.name);
        if !layout.is_installed() {
            return Err(LifecycleError::NotInstalled(inst.name));
        }
        self.preflight(&inst).await?;
        let timeout = timeout.unwrap_or_else(|| self.config.start_timeout());

        match self.launch(&mut inst, &layout, timeout).await {
            Ok(outcome) => Ok(outcome),
            Err(e @ LifecycleError::Unreachable { .. }) => Err(e),
            Err(e) => {
                let msg = format_error_chain(&anyhow::Error::from(e));
                tracing::error!(instance = %inst.name, error = %msg, "start failed");
                append_error_log(&layout.error_log(), &format!("start failed: {msg}")).await;
                Ok(StartOutcome::Failed(msg))
            }
        }
    }

    async fn launch(
        &self,
        inst: &mut Instance,
        layout: &InstanceLayout,
        timeout: Duration,
    ) -> Result<StartOutcome> {
        let interval = self.config.poll_interval();

        let ts_pid = self.host.launcher.spawn_timeseries(layout)?;
        inst.timeseries_pid = Some(ts_pid);
        if let Err(e) = self.store.save(inst).await {
            self.abandon_timeseries(&inst.name, layout, ts_pid).await;
            return Err(e);
        }
        tracing::info!(instance = %inst.name, engine = %EngineKind::Timeseries, pid = ts_pid, "engine spawned");

        let graph_pid = {
            // Held across snapshot and discovery so a concurrent start cannot
            // claim this instance's graph process.
            let _lock = HostLock::acquire(&self.config.locks_dir().join(DISCOVERY_LOCK)).await?;
            let signature = Signature(descriptor(EngineKind::Graph).signature);
            let before = matching_pids(&self.host.processes, signature).await;
            self.host
                .launcher
                .graph_command(layout, GraphAction::Start)
                .await?;
            discover_new_pid(
                &self.host.processes,
                signature,
                &before,
                timeout,
                interval,
            )
            .await
        };

        let Some(graph_pid) = graph_pid else {
            tracing::warn!(
                instance = %inst.name,
                engine = %EngineKind::Graph,
                timeout_secs = timeout.as_secs_f64(),
                "graph engine pid not discovered before timeout"
            );
            return Ok(StartOutcome::DiscoveryTimedOut);
        };
        inst.graph_pid = Some(graph_pid);
        self.store.save(inst).await?;
        tracing::info!(instance = %inst.name, engine = %EngineKind::Graph, pid = graph_pid, "engine discovered");

        let started = tokio::time::Instant::now();
        loop {
            if self.host.health.is_healthy(&inst.ports).await {
                break;
            }
            if started.elapsed() > timeout {
                inst.status = InstanceStatus::Error;
                self.store.save(inst).await?;
                let err = LifecycleError::Unreachable {
                    instance: inst.name.clone(),
                    timeout,
                };
                tracing::error!(instance = %inst.name, "{err}");
                append_error_log(&layout.error_log(), &err.to_string()).await;
                return Err(err);
            }
            tokio::time::sleep(interval).await;
        }

        inst.status = InstanceStatus::Running;
        self.store.save(inst).await?;
        tracing::info!(instance = %inst.name, "instance running");
        Ok(StartOutcome::Started)
    }

    /// Stops a Running instance and waits for both engine processes to exit.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let mut inst = self.load(name).await?;
        let Some(graph_pid) = inst.graph_pid else {
            return Err(LifecycleError::MissingGraphPid(inst.name));
        };
        if matches!(inst.status, InstanceStatus::Stopped | InstanceStatus::Error) {
            return Err(LifecycleError::AlreadyStopped(inst.name));
        }
        let layout = self.layout(&inst.name);

        if let Some(pid) = inst.timeseries_pid {
            self.interrupt_timeseries(&inst.name, &layout, pid).await;
        }

        self.host
            .launcher
            .graph_command(&layout, GraphAction::Stop)
            .await?;

        let pids: Vec<u32> = [inst.timeseries_pid, Some(graph_pid)]
            .into_iter()
            .flatten()
            .collect();
        self.await_exit(&inst.name, &pids).await?;

        inst.clear_pids();
        inst.status = InstanceStatus::Stopped;
        self.store.save(&inst).await?;
        tracing::info!(instance = %inst.name, "instance stopped");
        Ok(())
    }

    /// Interrupts a just-spawned engine whose pid could not be persisted.
    async fn abandon_timeseries(&self, instance: &str, layout: &InstanceLayout, pid: u32) {
        tracing::error!(instance, engine = %EngineKind::Timeseries, pid, "pid not recorded; interrupting engine");
        append_error_log(
            &layout.error_log(),
            &format!("could not record influxdb PID {pid}; interrupting it"),
        )
        .await;
        if let Err(e) = self.host.launcher.signal(pid, StopSignal::Interrupt) {
            tracing::warn!(instance, pid, error = %e, "failed to interrupt unrecorded time-series engine");
            append_error_log(&layout.error_log(), &e.to_string()).await;
        }
    }

    async fn interrupt_timeseries(&self, instance: &str, layout: &InstanceLayout, pid: u32) {
        match self.host.launcher.signal(pid, StopSignal::Interrupt) {
            Ok(()) => {
                tracing::info!(instance, engine = %EngineKind::Timeseries, pid, "interrupt sent");
            }
            Err(SignalError::NotFound(_)) => {
                tracing::warn!(instance, engine = %EngineKind::Timeseries, pid, "process not found");
                append_error_log(
                    &layout.error_log(),
                    &format!("Could not find influxdb running with PID {pid}"),
                )
                .await;
            }
            Err(e) => {
                tracing::warn!(instance, pid, error = %e, "failed to interrupt time-series engine");
                append_error_log(&layout.error_log(), &e.to_string()).await;
            }
        }
    }

    async fn await_exit(&self, instance: &str, pids: &[u32]) -> Result<()> {
        let limit = self.config.stop_timeout();
        let gone = wait_until_gone(
            &self.host.processes,
            pids,
            limit,
            self.config.poll_interval(),
        )
        .await;
        match (gone, limit) {
            (true, _) => Ok(()),
            (false, Some(timeout)) => Err(LifecycleError::StopTimeout {
                instance: instance.to_string(),
                timeout,
            }),
            (false, None) => Ok(()),
        }
    }

    /// Brings an instance with stale or partial process state back to a
    /// clean Stopped record, terminating whatever recorded pid is still alive.
    pub async fn recover(&self, name: &str) -> Result<Instance> {
        let mut inst = self.load(name).await?;
        let layout = self.layout(&inst.name);
        let live = live_pids(&self.host.processes).await;

        if let Some(pid) = inst.timeseries_pid
            && live.contains(&pid)
        {
            self.interrupt_timeseries(&inst.name, &layout, pid).await;
        }

        if let Some(pid) = inst.graph_pid
            && live.contains(&pid)
        {
            if let Err(e) = self
                .host
                .launcher
                .graph_command(&layout, GraphAction::Stop)
                .await
            {
                tracing::warn!(instance = %inst.name, error = %format_error_chain(&e), "graph stop command failed");
            }
            if live_pids(&self.host.processes).await.contains(&pid) {
                match self.host.launcher.signal(pid, StopSignal::Terminate) {
                    Ok(()) | Err(SignalError::NotFound(_)) => {}
                    Err(e) => {
                        tracing::warn!(instance = %inst.name, pid, error = %e, "failed to terminate graph engine");
                    }
                }
            }
        }

        let pids: Vec<u32> = [inst.timeseries_pid, inst.graph_pid]
            .into_iter()
            .flatten()
            .collect();
        self.await_exit(&inst.name, &pids).await?;

        let previous = inst.status;
        inst.clear_pids();
        inst.status = InstanceStatus::Stopped;
        self.store.save(&inst).await?;
        tracing::info!(instance = %inst.name, ?previous, "instance recovered");
        Ok(inst)
    }

    /// Stops the instance if needed, then removes its directory and record.
    /// Safe on an already stopped instance.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let inst = self.load(name).await?;
        if inst.status == InstanceStatus::Running && inst.graph_pid.is_some() {
            self.stop(&inst.name).await?;
        } else if inst.has_any_pid() {
            self.recover(&inst.name).await?;
        }

        let layout = self.layout(&inst.name);
        match tokio::fs::remove_dir_all(layout.dir()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.store.remove(&inst.name).await?;
        tracing::info!(instance = %inst.name, "instance deleted");
        Ok(())
    }

    pub async fn status(&self, name: &str) -> Result<InstanceStatus> {
        Ok(self.load(name).await?.status)
    }

    /// Live probe of both engines; never fails for an unreachable engine.
    pub async fn is_healthy(&self, name: &str) -> Result<bool> {
        let inst = self.load(name).await?;
        Ok(self.host.health.is_healthy(&inst.ports).await)
    }

    pub async fn ports(&self, name: &str) -> Result<BTreeMap<PortRole, u16>> {
        Ok(self.load(name).await?.ports.to_map())
    }

    pub async fn directory(&self, name: &str) -> Result<PathBuf> {
        let inst = self.load(name).await?;
        Ok(self.layout(&inst.name).dir().to_path_buf())
    }

    pub async fn summary(&self, name: &str) -> Result<InstanceSummary> {
        Ok(self.load(name).await?.summary())
    }

    pub async fn list(&self) -> Result<Vec<InstanceSummary>> {
        Ok(self
            .store
            .list()
            .await?
            .iter()
            .map(Instance::summary)
            .collect())
    }
}
