use std::{
    collections::{BTreeMap, BTreeSet},
    net::{Ipv4Addr, SocketAddr, TcpStream},
    time::Duration,
};

use dbvisor_instance::{EngineKind, PortAssignments};

const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Host-wide view of which ports are taken.
pub trait PortProbe: Send + Sync {
    /// TCP connect probe: something answers on the local port.
    fn in_use(&self, port: u16) -> bool;

    /// Every port currently bound on the host, as far as the OS will say.
    fn bound_ports(&self) -> BTreeSet<u16>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemPorts;

impl PortProbe for SystemPorts {
    fn in_use(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        TcpStream::connect_timeout(&addr, CONNECT_PROBE_TIMEOUT).is_ok()
    }

    fn bound_ports(&self) -> BTreeSet<u16> {
        scan_bound_ports()
    }
}

#[cfg(target_os = "linux")]
fn scan_bound_ports() -> BTreeSet<u16> {
    let mut out = BTreeSet::new();
    for (file, tcp) in [
        ("/proc/net/tcp", true),
        ("/proc/net/tcp6", true),
        ("/proc/net/udp", false),
        ("/proc/net/udp6", false),
    ] {
        // Missing tables (no IPv6, locked-down /proc) just contribute nothing.
        if let Ok(raw) = std::fs::read_to_string(file) {
            out.extend(parse_proc_net(&raw, tcp));
        }
    }
    out
}

#[cfg(not(target_os = "linux"))]
fn scan_bound_ports() -> BTreeSet<u16> {
    let out = match std::process::Command::new("netstat").arg("-an").output() {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "netstat unavailable; host port scan skipped");
            return BTreeSet::new();
        }
    };
    parse_netstat(&String::from_utf8_lossy(&out.stdout))
}

/// Local ports from a `/proc/net/{tcp,udp}[6]` table. TCP rows count only
/// when listening (state 0A); every UDP row is a bound socket.
pub fn parse_proc_net(raw: &str, tcp: bool) -> Vec<u16> {
    const TCP_LISTEN: &str = "0A";

    let mut out = Vec::new();
    for line in raw.lines().skip(1) {
        let mut cols = line.split_whitespace();
        let _slot = cols.next();
        let Some(local) = cols.next() else {
            continue;
        };
        let _remote = cols.next();
        let Some(state) = cols.next() else {
            continue;
        };
        if tcp && state != TCP_LISTEN {
            continue;
        }
        let Some((_, port_hex)) = local.rsplit_once(':') else {
            continue;
        };
        if let Ok(port) = u16::from_str_radix(port_hex, 16)
            && port != 0
        {
            out.push(port);
        }
    }
    out
}

/// Local ports from `netstat -an` output (BSD/macOS `addr.port`, Windows
/// `addr:port`). TCP rows count only when listening.
pub fn parse_netstat(raw: &str) -> BTreeSet<u16> {
    let mut out = BTreeSet::new();
    for line in raw.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let Some(proto) = cols.first().map(|p| p.to_ascii_lowercase()) else {
            continue;
        };
        let is_tcp = proto.starts_with("tcp");
        let is_udp = proto.starts_with("udp");
        if !is_tcp && !is_udp {
            continue;
        }
        let listening = cols
            .iter()
            .any(|c| c.eq_ignore_ascii_case("listen") || c.eq_ignore_ascii_case("listening"));
        if is_tcp && !listening {
            continue;
        }

        // Windows puts the local address in column 1, BSD after Recv-Q/Send-Q.
        let local = if cols.len() > 3 && cols[1].chars().all(|c| c.is_ascii_digit()) {
            cols[3]
        } else if cols.len() > 1 {
            cols[1]
        } else {
            continue;
        };
        let Some(idx) = local.rfind([':', '.']) else {
            continue;
        };
        if let Ok(port) = local[(idx + 1)..].parse::<u16>()
            && port != 0
        {
            out.insert(port);
        }
    }
    out
}

/// Hands out ports from one increasing cursor per engine family, skipping
/// anything already taken.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    cursors: BTreeMap<EngineKind, u32>,
    taken: BTreeSet<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted(pub EngineKind);

impl PortAllocator {
    pub fn new(bases: impl IntoIterator<Item = (EngineKind, u16)>, taken: BTreeSet<u16>) -> Self {
        Self {
            cursors: bases.into_iter().map(|(k, p)| (k, u32::from(p))).collect(),
            taken,
        }
    }

    /// Assigns every unset role; set roles are left untouched.
    pub fn fill(&mut self, ports: &mut PortAssignments) -> Result<(), Exhausted> {
        // Ports this instance already holds are off limits for its other roles.
        self.taken.extend(ports.values());

        let missing: Vec<_> = ports.missing().collect();
        for role in missing {
            let family = role.engine();
            let cursor = self.cursors.entry(family).or_insert(1024);
            loop {
                let Ok(candidate) = u16::try_from(*cursor) else {
                    return Err(Exhausted(family));
                };
                *cursor += 1;
                if candidate != 0 && self.taken.insert(candidate) {
                    ports.assign(role, candidate);
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dbvisor_instance::PortRole;

    use super::*;

    fn allocator(taken: &[u16]) -> PortAllocator {
        PortAllocator::new(
            [(EngineKind::Graph, 7400), (EngineKind::Timeseries, 8400)],
            taken.iter().copied().collect(),
        )
    }

    #[test]
    fn fresh_instance_gets_sequential_ports_per_family() {
        let mut ports = PortAssignments::default();
        allocator(&[]).fill(&mut ports).unwrap();

        assert_eq!(ports.get(PortRole::GraphHttp), Some(7400));
        assert_eq!(ports.get(PortRole::GraphHttps), Some(7401));
        assert_eq!(ports.get(PortRole::GraphBolt), Some(7402));
        assert_eq!(ports.get(PortRole::GraphAdmin), Some(7403));
        assert_eq!(ports.get(PortRole::TimeseriesHttp), Some(8400));
        assert_eq!(ports.get(PortRole::TimeseriesAdmin), Some(8403));
    }

    #[test]
    fn taken_ports_are_skipped() {
        let mut ports = PortAssignments::default();
        allocator(&[7400, 7402, 8401]).fill(&mut ports).unwrap();

        assert_eq!(ports.get(PortRole::GraphHttp), Some(7401));
        assert_eq!(ports.get(PortRole::GraphHttps), Some(7403));
        assert_eq!(ports.get(PortRole::TimeseriesHttp), Some(8400));
        assert_eq!(ports.get(PortRole::TimeseriesMeta), Some(8402));
    }

    #[test]
    fn preset_roles_are_kept_and_reserved() {
        let mut ports = PortAssignments::default();
        ports.assign(PortRole::GraphBolt, 7400);
        allocator(&[]).fill(&mut ports).unwrap();

        assert_eq!(ports.get(PortRole::GraphBolt), Some(7400));
        assert_eq!(ports.get(PortRole::GraphHttp), Some(7401));
        let all: BTreeSet<u16> = ports.values().collect();
        assert_eq!(all.len(), 8);
    }

    #[test]
    fn running_off_the_end_reports_the_family() {
        let mut ports = PortAssignments::default();
        let mut alloc = PortAllocator::new(
            [(EngineKind::Graph, 65534), (EngineKind::Timeseries, 8400)],
            BTreeSet::new(),
        );
        assert_eq!(alloc.fill(&mut ports), Err(Exhausted(EngineKind::Graph)));
    }

    #[test]
    fn proc_net_tcp_only_counts_listeners() {
        let raw = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:1CE8 00000000:0000 0A 00000000:00000000 00:00000000 00000000   100        0 1 1
   1: 0100007F:1F90 0100007F:A2B4 01 00000000:00000000 00:00000000 00000000   100        0 2 1
";
        assert_eq!(parse_proc_net(raw, true), vec![7400]);
        assert_eq!(parse_proc_net(raw, false), vec![7400, 8080]);
    }

    #[test]
    fn proc_net_tcp6_addresses_parse() {
        let raw = "\
  sl  local_address                         remote_address                        st
   0: 00000000000000000000000000000000:20C4 00000000000000000000000000000000:0000 0A
";
        assert_eq!(parse_proc_net(raw, true), vec![8388]);
    }

    #[test]
    fn netstat_bsd_and_windows_formats() {
        let bsd = "\
Proto Recv-Q Send-Q  Local Address          Foreign Address        (state)
tcp4       0      0  127.0.0.1.7474         *.*                    LISTEN
tcp4       0      0  10.0.0.2.50123         1.2.3.4.443            ESTABLISHED
udp4       0      0  *.8089                 *.*
";
        let got = parse_netstat(bsd);
        assert!(got.contains(&7474));
        assert!(got.contains(&8089));
        assert!(!got.contains(&50123));

        let win = "\
  Proto  Local Address          Foreign Address        State
  TCP    0.0.0.0:8086           0.0.0.0:0              LISTENING
  UDP    0.0.0.0:8089           *:*
";
        let got = parse_netstat(win);
        assert_eq!(got, [8086, 8089].into_iter().collect());
    }

    #[test]
    fn connect_probe_sees_a_listener() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(SystemPorts.in_use(port));
        drop(listener);
    }
}
