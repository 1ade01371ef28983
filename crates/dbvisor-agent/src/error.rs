use std::time::Duration;

use dbvisor_instance::PortRole;
use thiserror::Error;

/// Errors surfaced by the lifecycle controller.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("invalid instance name: {0:?}")]
    InvalidName(String),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("instance already exists: {0}")]
    AlreadyExists(String),

    #[error(
        "port {port} ({role}) is currently in use on this machine; stop the process using it so that {instance} can run"
    )]
    PortConflict {
        instance: String,
        role: PortRole,
        port: u16,
    },

    #[error("port {port} requested for {role} of {instance} is already assigned or bound")]
    PortTaken {
        instance: String,
        role: PortRole,
        port: u16,
    },

    #[error("instance {0} has no allocated port for {1}")]
    PortMissing(String, PortRole),

    #[error("ran out of ports above the configured base for {0}")]
    PortsExhausted(String),

    #[error("instance {0} is not installed")]
    NotInstalled(String),

    #[error("no graph engine pid recorded for {0}")]
    MissingGraphPid(String),

    #[error("instance {0} is already stopped")]
    AlreadyStopped(String),

    #[error("engines for {instance} did not answer within {}s", .timeout.as_secs())]
    Unreachable { instance: String, timeout: Duration },

    #[error("engines for {instance} did not exit within {}s", .timeout.as_secs())]
    StopTimeout { instance: String, timeout: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
