use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::{Parser, Subcommand};
use dbvisor_agent::{AgentConfig, HostServices, LifecycleController, StartOutcome};
use dbvisor_instance::{PortAssignments, PortRole};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dbvisor")]
#[command(about = "Per-tenant graph and time-series database supervisor")]
#[command(version)]
struct Cli {
    /// TOML config file (falls back to DBVISOR_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Allocate ports for a new instance and install its engines
    Create {
        name: String,
        /// Only allocate and persist; `install` must run before `start`
        #[arg(long)]
        no_install: bool,
        /// Fixed port for one role, e.g. `--port graph_bolt=7687` (repeatable)
        #[arg(long = "port", value_name = "ROLE=PORT", value_parser = parse_port_preset)]
        ports: Vec<(PortRole, u16)>,
    },

    /// Reinstall both engines, discarding the instance directory
    Install { name: String },

    /// Launch both engines and wait until they answer
    Start {
        name: String,
        /// Seconds to wait for discovery and for the health probe
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Stop both engines and wait for them to exit
    Stop { name: String },

    /// Print the stored record and a live health probe
    Status { name: String },

    /// Print the eight assigned ports
    Ports { name: String },

    /// Print the instance directory
    Dir { name: String },

    /// List all instances
    List,

    /// Reset an instance with stale process state to Stopped
    Recover { name: String },

    /// Stop if needed and remove the instance
    Delete { name: String },
}

fn parse_port_preset(raw: &str) -> Result<(PortRole, u16), String> {
    let (role, port) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected ROLE=PORT, got `{raw}`"))?;
    let role: PortRole = role.parse().map_err(|e| format!("{e}"))?;
    let port: u16 = port
        .trim()
        .parse()
        .map_err(|e| format!("invalid port `{port}`: {e}"))?;
    if port == 0 {
        return Err("port 0 cannot be assigned".to_string());
    }
    Ok((role, port))
}

fn init_tracing(config: &AgentConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let logs_dir = config.logs_dir();
    match std::fs::create_dir_all(&logs_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&logs_dir, "dbvisor.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            tracing::warn!(dir = %logs_dir.display(), error = %e, "log directory unavailable; logging to stderr only");
            None
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = AgentConfig::load(cli.config.as_deref())?;
    let _guard = init_tracing(&config);

    let host = HostServices::system(&config)?;
    let ctl = LifecycleController::new(config, host);

    match cli.command {
        Commands::Create {
            name,
            no_install,
            ports,
        } => {
            let mut preset = PortAssignments::default();
            for (role, port) in ports {
                if !preset.assign(role, port) {
                    anyhow::bail!("--port given twice for {role}");
                }
            }
            let inst = ctl.create_with_ports(&name, preset).await?;
            if !no_install {
                ctl.ensure_installed(&inst.name).await?;
            }
            print_json(&inst.summary())?;
        }
        Commands::Install { name } => {
            ctl.install(&name).await?;
        }
        Commands::Start { name, timeout } => {
            let outcome = ctl.start(&name, timeout.map(Duration::from_secs)).await?;
            match outcome {
                StartOutcome::Started => println!("started {name}"),
                StartOutcome::AlreadyRunning => {
                    eprintln!("{name} is already running");
                    return Ok(ExitCode::FAILURE);
                }
                StartOutcome::DiscoveryTimedOut => {
                    eprintln!("{name}: graph engine did not appear before the timeout; run `dbvisor recover {name}`");
                    return Ok(ExitCode::FAILURE);
                }
                StartOutcome::Failed(msg) => {
                    eprintln!("{name}: start failed: {msg}");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Commands::Stop { name } => {
            ctl.stop(&name).await?;
            println!("stopped {name}");
        }
        Commands::Status { name } => {
            let summary = ctl.summary(&name).await?;
            let healthy = ctl.is_healthy(&name).await?;
            print_json(&serde_json::json!({
                "instance": summary,
                "healthy": healthy,
            }))?;
        }
        Commands::Ports { name } => {
            print_json(&ctl.ports(&name).await?)?;
        }
        Commands::Dir { name } => {
            println!("{}", ctl.directory(&name).await?.display());
        }
        Commands::List => {
            print_json(&ctl.list().await?)?;
        }
        Commands::Recover { name } => {
            print_json(&ctl.recover(&name).await?.summary())?;
        }
        Commands::Delete { name } => {
            ctl.delete(&name).await?;
            println!("deleted {name}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_presets_parse_role_and_number() {
        assert_eq!(
            parse_port_preset("graph_bolt=7687"),
            Ok((PortRole::GraphBolt, 7687))
        );
        assert!(parse_port_preset("graph_bolt").is_err());
        assert!(parse_port_preset("bolt=7687").is_err());
        assert!(parse_port_preset("graph_bolt=0").is_err());
        assert!(parse_port_preset("graph_bolt=70000").is_err());
    }

    #[test]
    fn create_accepts_repeated_port_flags() {
        let cli = Cli::try_parse_from([
            "dbvisor",
            "create",
            "corpusA",
            "--no-install",
            "--port",
            "graph_http=7474",
            "--port",
            "timeseries_http=8086",
        ])
        .unwrap();
        let Commands::Create { ports, .. } = cli.command else {
            panic!("expected create");
        };
        assert_eq!(
            ports,
            vec![(PortRole::GraphHttp, 7474), (PortRole::TimeseriesHttp, 8086)]
        );
    }
}
