//! Per-engine capability table and the on-disk layout of an instance.
//!
//! Platform differences (executable names, whether an archive is installed at
//! all) are resolved once when the table is first touched.

use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};

use dbvisor_instance::EngineKind;

pub const ERROR_LOG: &str = "error.log";
pub const INSTALL_MARKER: &str = ".installed";

/// How the engine binary is located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executable {
    /// Path segments below the instance's engine directory.
    InEngineDir(&'static [&'static str]),
    /// Resolved from `PATH` (no per-instance copy).
    OnPath(&'static str),
}

/// How the engine process is brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// `<exe> <arg>` hands off to a background process and returns.
    Trigger(&'static str),
    /// `<exe> <flag> <config>` runs in the foreground; its pid is the engine pid.
    Foreground { config_flag: &'static str },
}

/// How the engine process is brought down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// `<exe> <arg>` asks the engine to stop itself.
    StopCommand(&'static str),
    /// SIGINT to the recorded pid.
    Interrupt,
}

#[derive(Debug, Clone)]
pub struct EngineDescriptor {
    pub kind: EngineKind,
    pub display_name: &'static str,
    pub dir_name: &'static str,
    pub log_file: &'static str,
    pub executable: Executable,
    pub config_file: &'static [&'static str],
    pub template: &'static str,
    /// Every token must appear in a process command line for it to count
    /// as this engine.
    pub signature: &'static [&'static str],
    pub start: StartMode,
    pub shutdown: Shutdown,
    /// False when the platform provides the engine outside the instance dir.
    pub installs_archive: bool,
}

const NEO4J_TEMPLATE: &str = include_str!("../templates/neo4j.conf");
const INFLUXDB_TEMPLATE: &str = include_str!("../templates/influxdb.conf");

fn build_table() -> [EngineDescriptor; 2] {
    let neo4j_exe: &'static [&'static str] = if cfg!(windows) {
        &["bin", "neo4j.bat"]
    } else {
        &["bin", "neo4j"]
    };

    let (influx_exe, influx_installs) = if cfg!(target_os = "macos") {
        (Executable::OnPath("influxd"), false)
    } else if cfg!(windows) {
        (Executable::InEngineDir(&["influxd.exe"]), true)
    } else {
        (Executable::InEngineDir(&["usr", "bin", "influxd"]), true)
    };

    [
        EngineDescriptor {
            kind: EngineKind::Graph,
            display_name: "neo4j",
            dir_name: "neo4j",
            log_file: "neo4j.log",
            executable: Executable::InEngineDir(neo4j_exe),
            config_file: &["conf", "neo4j.conf"],
            template: NEO4J_TEMPLATE,
            signature: &["java", "neo4j"],
            start: StartMode::Trigger("start"),
            shutdown: Shutdown::StopCommand("stop"),
            installs_archive: true,
        },
        EngineDescriptor {
            kind: EngineKind::Timeseries,
            display_name: "influxdb",
            dir_name: "influxdb",
            log_file: "influxdb.log",
            executable: influx_exe,
            config_file: &["influxdb.conf"],
            template: INFLUXDB_TEMPLATE,
            signature: &["influxd"],
            start: StartMode::Foreground {
                config_flag: "-config",
            },
            shutdown: Shutdown::Interrupt,
            installs_archive: influx_installs,
        },
    ]
}

pub fn descriptor(kind: EngineKind) -> &'static EngineDescriptor {
    static TABLE: OnceLock<[EngineDescriptor; 2]> = OnceLock::new();
    let table = TABLE.get_or_init(build_table);
    match kind {
        EngineKind::Graph => &table[0],
        EngineKind::Timeseries => &table[1],
    }
}

/// Storage roles rendered into the time-series config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageRole {
    Data,
    Wal,
    Meta,
}

impl StorageRole {
    pub const ALL: [StorageRole; 3] = [StorageRole::Data, StorageRole::Wal, StorageRole::Meta];

    pub fn dir_name(self) -> &'static str {
        match self {
            StorageRole::Data => "data",
            StorageRole::Wal => "wal",
            StorageRole::Meta => "meta",
        }
    }
}

/// Paths for one instance: `<instances_root>/<name>/...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    dir: PathBuf,
}

impl InstanceLayout {
    pub fn new(instances_root: &Path, name: &str) -> Self {
        Self {
            dir: instances_root.join(name),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn error_log(&self) -> PathBuf {
        self.dir.join(ERROR_LOG)
    }

    pub fn engine_dir(&self, kind: EngineKind) -> PathBuf {
        self.dir.join(descriptor(kind).dir_name)
    }

    pub fn engine_log(&self, kind: EngineKind) -> PathBuf {
        self.dir.join(descriptor(kind).log_file)
    }

    pub fn executable(&self, kind: EngineKind) -> PathBuf {
        match descriptor(kind).executable {
            Executable::InEngineDir(parts) => {
                let mut p = self.engine_dir(kind);
                p.extend(parts);
                p
            }
            Executable::OnPath(name) => PathBuf::from(name),
        }
    }

    pub fn config_path(&self, kind: EngineKind) -> PathBuf {
        let mut p = self.engine_dir(kind);
        p.extend(descriptor(kind).config_file);
        p
    }

    pub fn storage_dir(&self, kind: EngineKind, role: StorageRole) -> PathBuf {
        self.engine_dir(kind).join(role.dir_name())
    }

    /// Written last by a completed install.
    pub fn install_marker(&self) -> PathBuf {
        self.dir.join(INSTALL_MARKER)
    }

    /// A completed install: marker, both configs, and every executable that
    /// lives inside the instance.
    pub fn is_installed(&self) -> bool {
        self.install_marker().is_file()
            && EngineKind::ALL.into_iter().all(|kind| {
                let exe_ok = match descriptor(kind).executable {
                    Executable::InEngineDir(_) => self.executable(kind).is_file(),
                    Executable::OnPath(_) => true,
                };
                exe_ok && self.config_path(kind).is_file()
            })
    }
}
