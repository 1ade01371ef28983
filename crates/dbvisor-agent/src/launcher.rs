//! Starting and stopping engine processes.
//!
//! Children are detached (own session, no stdin) and write stdout/stderr to
//! the instance's engine log so they outlive the agent.

use std::{fs::OpenOptions, path::Path, process::Stdio};

use anyhow::Context;
use dbvisor_instance::EngineKind;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::process::Command;

use crate::engine::{InstanceLayout, Shutdown, StartMode, descriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
}

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("no process with pid {0}")]
    NotFound(u32),

    #[error("signal pid {pid}: {source}")]
    Failed {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

pub trait Launcher: Send + Sync {
    /// Spawns the time-series engine in the foreground mode and returns its pid.
    fn spawn_timeseries(&self, layout: &InstanceLayout) -> anyhow::Result<u32>;

    /// Runs the graph engine's own control command to completion.
    fn graph_command<'a>(
        &'a self,
        layout: &'a InstanceLayout,
        action: GraphAction,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), SignalError>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemLauncher;

fn open_log(path: &Path) -> anyhow::Result<(Stdio, Stdio)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open engine log {}", path.display()))?;
    let err = out.try_clone()?;
    Ok((Stdio::from(out), Stdio::from(err)))
}

fn detach(cmd: &mut Command) {
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    #[cfg(windows)]
    {
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }
}

impl Launcher for SystemLauncher {
    fn spawn_timeseries(&self, layout: &InstanceLayout) -> anyhow::Result<u32> {
        let kind = EngineKind::Timeseries;
        let desc = descriptor(kind);
        let StartMode::Foreground { config_flag } = desc.start else {
            anyhow::bail!("{} is not started in the foreground", desc.display_name);
        };

        let exe = layout.executable(kind);
        let config = layout.config_path(kind);
        let (stdout, stderr) = open_log(&layout.engine_log(kind))?;

        let mut cmd = Command::new(&exe);
        cmd.arg(config_flag)
            .arg(&config)
            .current_dir(layout.dir())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        detach(&mut cmd);

        // Dropping the handle does not kill the child; tokio reaps it later.
        let child = cmd
            .spawn()
            .with_context(|| format!("spawn {} ({})", desc.display_name, exe.display()))?;
        child
            .id()
            .ok_or_else(|| anyhow::anyhow!("{} exited before reporting a pid", desc.display_name))
    }

    fn graph_command<'a>(
        &'a self,
        layout: &'a InstanceLayout,
        action: GraphAction,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let kind = EngineKind::Graph;
            let desc = descriptor(kind);
            let arg = match (action, desc.start, desc.shutdown) {
                (GraphAction::Start, StartMode::Trigger(arg), _) => arg,
                (GraphAction::Stop, _, Shutdown::StopCommand(arg)) => arg,
                _ => anyhow::bail!("{} has no {action:?} command", desc.display_name),
            };

            let exe = layout.executable(kind);
            if !exe.exists() {
                if action == GraphAction::Stop {
                    tracing::warn!(exe = %exe.display(), "graph engine executable missing; stop command skipped");
                    return Ok(());
                }
                anyhow::bail!("graph engine executable not found: {}", exe.display());
            }

            let (stdout, stderr) = open_log(&layout.engine_log(kind))?;
            let status = Command::new(&exe)
                .arg(arg)
                .current_dir(layout.dir())
                .stdin(Stdio::null())
                .stdout(stdout)
                .stderr(stderr)
                .status()
                .await
                .with_context(|| format!("run {} {arg}", exe.display()))?;

            if !status.success() {
                tracing::warn!(%status, command = arg, "graph engine control command exited non-zero");
            }
            Ok(())
        })
    }

    #[cfg(unix)]
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), SignalError> {
        let sig = match signal {
            StopSignal::Interrupt => libc::SIGINT,
            StopSignal::Terminate => libc::SIGTERM,
        };
        let raw = libc::pid_t::try_from(pid).map_err(|_| SignalError::NotFound(pid))?;
        let rc = unsafe { libc::kill(raw, sig) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Err(SignalError::NotFound(pid));
        }
        Err(SignalError::Failed { pid, source: err })
    }

    #[cfg(not(unix))]
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), SignalError> {
        let mut cmd = std::process::Command::new("taskkill");
        cmd.arg("/PID").arg(pid.to_string());
        if signal == StopSignal::Terminate {
            cmd.arg("/F");
        }
        let out = cmd
            .output()
            .map_err(|source| SignalError::Failed { pid, source })?;
        if out.status.success() {
            return Ok(());
        }
        // taskkill exits 128 when the pid does not exist.
        if out.status.code() == Some(128) {
            return Err(SignalError::NotFound(pid));
        }
        Err(SignalError::Failed {
            pid,
            source: std::io::Error::other(String::from_utf8_lossy(&out.stderr).into_owned()),
        })
    }
}
