//! Host process table queries and pid discovery by snapshot diff.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub cmdline: String,
}

pub trait ProcessTable: Send + Sync {
    /// Live processes on the host. Zombies and threads are not processes.
    fn snapshot(&self) -> Vec<ProcessEntry>;
}

pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn snapshot(&self) -> Vec<ProcessEntry> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );

        system
            .processes()
            .iter()
            // Linux reports every thread as an entry carrying its process's
            // command line; a thread id is never an engine pid.
            .filter(|(_, p)| p.thread_kind().is_none())
            .filter(|(_, p)| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .map(|(pid, p)| {
                let mut cmdline = p
                    .cmd()
                    .iter()
                    .map(|a| a.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ");
                if cmdline.is_empty() {
                    cmdline = p.name().to_string_lossy().into_owned();
                }
                ProcessEntry {
                    pid: pid.as_u32(),
                    cmdline,
                }
            })
            .collect()
    }
}

/// Runs a snapshot on the blocking pool; a full table refresh reads every
/// entry under /proc.
pub async fn snapshot(table: &Arc<dyn ProcessTable>) -> Vec<ProcessEntry> {
    let table = table.clone();
    match tokio::task::spawn_blocking(move || table.snapshot()).await {
        Ok(entries) => entries,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => {
            tracing::warn!(error = %e, "process table snapshot cancelled");
            Vec::new()
        }
    }
}

/// Tokens that must all occur in a command line.
#[derive(Debug, Clone, Copy)]
pub struct Signature(pub &'static [&'static str]);

impl Signature {
    pub fn matches(&self, cmdline: &str) -> bool {
        !self.0.is_empty() && self.0.iter().all(|t| cmdline.contains(t))
    }
}

pub async fn matching_pids(table: &Arc<dyn ProcessTable>, signature: Signature) -> BTreeSet<u32> {
    snapshot(table)
        .await
        .into_iter()
        .filter(|e| signature.matches(&e.cmdline))
        .map(|e| e.pid)
        .collect()
}

pub async fn live_pids(table: &Arc<dyn ProcessTable>) -> BTreeSet<u32> {
    snapshot(table).await.into_iter().map(|e| e.pid).collect()
}

/// Re-scans every `interval` until a process matching `signature` shows up
/// that was not in `before`. `None` once `timeout` has passed.
pub async fn discover_new_pid(
    table: &Arc<dyn ProcessTable>,
    signature: Signature,
    before: &BTreeSet<u32>,
    timeout: Duration,
    interval: Duration,
) -> Option<u32> {
    let started = tokio::time::Instant::now();
    loop {
        tokio::time::sleep(interval).await;
        if started.elapsed() > timeout {
            return None;
        }
        let found = matching_pids(table, signature)
            .await
            .into_iter()
            .find(|pid| !before.contains(pid));
        if found.is_some() {
            return found;
        }
    }
}

/// Polls until none of `pids` is live. `false` if `timeout` passed first.
pub async fn wait_until_gone(
    table: &Arc<dyn ProcessTable>,
    pids: &[u32],
    timeout: Option<Duration>,
    interval: Duration,
) -> bool {
    let started = tokio::time::Instant::now();
    loop {
        let live = live_pids(table).await;
        if !pids.iter().any(|p| live.contains(p)) {
            return true;
        }
        if let Some(limit) = timeout
            && started.elapsed() > limit
        {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Returns `rounds[i]` on the i-th snapshot, repeating the last one.
    struct Scripted {
        rounds: Vec<Vec<ProcessEntry>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(rounds: Vec<Vec<(u32, &str)>>) -> Arc<dyn ProcessTable> {
            Arc::new(Self {
                rounds: rounds
                    .into_iter()
                    .map(|r| {
                        r.into_iter()
                            .map(|(pid, cmd)| ProcessEntry {
                                pid,
                                cmdline: cmd.to_string(),
                            })
                            .collect()
                    })
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ProcessTable for Scripted {
        fn snapshot(&self) -> Vec<ProcessEntry> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            self.rounds[i.min(self.rounds.len() - 1)].clone()
        }
    }

    const NEO4J: Signature = Signature(&["java", "neo4j"]);

    #[test]
    fn signature_needs_every_token() {
        assert!(NEO4J.matches("/usr/bin/java -Dneo4j.home=/data/a org.neo4j.server.CommunityEntryPoint"));
        assert!(!NEO4J.matches("/usr/bin/java -jar server.jar"));
        assert!(!Signature(&[]).matches("anything"));
    }

    #[tokio::test]
    async fn discovery_ignores_preexisting_engines() {
        let table = Scripted::new(vec![
            vec![(10, "java neo4j other-tenant")],
            vec![(10, "java neo4j other-tenant")],
            vec![(10, "java neo4j other-tenant"), (42, "java neo4j mine")],
        ]);
        let before = matching_pids(&table, NEO4J).await;
        assert_eq!(before, [10].into_iter().collect());

        let pid = discover_new_pid(
            &table,
            NEO4J,
            &before,
            Duration::from_secs(5),
            Duration::from_millis(5),
        )
        .await;
        assert_eq!(pid, Some(42));
    }

    #[tokio::test]
    async fn discovery_gives_up_after_timeout() {
        let table = Scripted::new(vec![vec![(10, "java neo4j")]]);
        let before = matching_pids(&table, NEO4J).await;
        let started = std::time::Instant::now();
        let pid = discover_new_pid(
            &table,
            NEO4J,
            &before,
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(pid, None);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn wait_until_gone_honours_bound() {
        let table = Scripted::new(vec![vec![(7, "influxd")]]);
        let gone = wait_until_gone(
            &table,
            &[7],
            Some(Duration::from_millis(30)),
            Duration::from_millis(5),
        )
        .await;
        assert!(!gone);

        let table = Scripted::new(vec![vec![(7, "influxd")], vec![]]);
        assert!(wait_until_gone(&table, &[7], None, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn system_table_lists_this_process() {
        let table: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable::new());
        let me = std::process::id();
        assert!(live_pids(&table).await.contains(&me));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn threads_of_a_running_engine_are_not_new_pids() {
        // This test binary stands in for an engine that was already running
        // when discovery began.
        const SELF: Signature = Signature(&["dbvisor_agent"]);
        let table: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable::new());
        let me = std::process::id();

        let before = matching_pids(&table, SELF).await;
        assert!(before.contains(&me));

        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let worker = std::thread::spawn(move || {
            let _ = stop_rx.recv_timeout(Duration::from_secs(10));
        });

        let pid = discover_new_pid(
            &table,
            SELF,
            &before,
            Duration::from_millis(200),
            Duration::from_millis(20),
        )
        .await;

        let _ = stop_tx.send(());
        worker.join().unwrap();
        assert_eq!(pid, None);

        let thread_ids: Vec<u32> = std::fs::read_dir(format!("/proc/{me}/task"))
            .unwrap()
            .filter_map(|e| e.ok()?.file_name().to_str()?.parse().ok())
            .filter(|tid| *tid != me)
            .collect();
        let live = live_pids(&table).await;
        assert!(thread_ids.iter().all(|tid| !live.contains(tid)));
    }
}
