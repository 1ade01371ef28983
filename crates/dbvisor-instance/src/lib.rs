use std::{collections::BTreeMap, fmt, str::FromStr};

use specta::Type;

/// The two backing engines supervised per instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Graph,
    Timeseries,
}

impl EngineKind {
    pub const ALL: [EngineKind; 2] = [EngineKind::Graph, EngineKind::Timeseries];

    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Graph => "graph",
            EngineKind::Timeseries => "timeseries",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the eight network ports an instance owns.
///
/// The declaration order is the allocation order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    GraphHttp,
    GraphHttps,
    GraphBolt,
    GraphAdmin,
    TimeseriesHttp,
    TimeseriesMeta,
    TimeseriesUdp,
    TimeseriesAdmin,
}

impl PortRole {
    pub const ALL: [PortRole; 8] = [
        PortRole::GraphHttp,
        PortRole::GraphHttps,
        PortRole::GraphBolt,
        PortRole::GraphAdmin,
        PortRole::TimeseriesHttp,
        PortRole::TimeseriesMeta,
        PortRole::TimeseriesUdp,
        PortRole::TimeseriesAdmin,
    ];

    pub fn engine(self) -> EngineKind {
        match self {
            PortRole::GraphHttp | PortRole::GraphHttps | PortRole::GraphBolt | PortRole::GraphAdmin => {
                EngineKind::Graph
            }
            _ => EngineKind::Timeseries,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PortRole::GraphHttp => "graph_http",
            PortRole::GraphHttps => "graph_https",
            PortRole::GraphBolt => "graph_bolt",
            PortRole::GraphAdmin => "graph_admin",
            PortRole::TimeseriesHttp => "timeseries_http",
            PortRole::TimeseriesMeta => "timeseries_meta",
            PortRole::TimeseriesUdp => "timeseries_udp",
            PortRole::TimeseriesAdmin => "timeseries_admin",
        }
    }
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A role name that is not one of the eight `PortRole` keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPortRole(pub String);

impl fmt::Display for UnknownPortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown port role `{}`", self.0)
    }
}

impl std::error::Error for UnknownPortRole {}

impl FromStr for PortRole {
    type Err = UnknownPortRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace('-', "_");
        PortRole::ALL
            .into_iter()
            .find(|r| r.as_str() == key)
            .ok_or_else(|| UnknownPortRole(s.to_string()))
    }
}

/// Ports keyed by role. A role, once assigned, keeps its port.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct PortAssignments(BTreeMap<PortRole, u16>);

impl PortAssignments {
    pub fn get(&self, role: PortRole) -> Option<u16> {
        self.0.get(&role).copied()
    }

    /// Returns false (and keeps the old value) if the role is already set.
    pub fn assign(&mut self, role: PortRole, port: u16) -> bool {
        if self.0.contains_key(&role) {
            return false;
        }
        self.0.insert(role, port);
        true
    }

    pub fn missing(&self) -> impl Iterator<Item = PortRole> + '_ {
        PortRole::ALL
            .into_iter()
            .filter(|r| !self.0.contains_key(r))
    }

    pub fn is_complete(&self) -> bool {
        self.missing().next().is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PortRole, u16)> + '_ {
        self.0.iter().map(|(r, p)| (*r, *p))
    }

    pub fn values(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.values().copied()
    }

    pub fn to_map(&self) -> BTreeMap<PortRole, u16> {
        self.0.clone()
    }
}

impl FromIterator<(PortRole, u16)> for PortAssignments {
    fn from_iter<T: IntoIterator<Item = (PortRole, u16)>>(iter: T) -> Self {
        let mut out = PortAssignments::default();
        for (role, port) in iter {
            out.assign(role, port);
        }
        out
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Stopped,
    Running,
    Error,
}

/// Persisted record of one tenant's engine pair.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub ports: PortAssignments,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub graph_pid: Option<u32>,
    #[serde(default)]
    pub timeseries_pid: Option<u32>,
}

impl Instance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ports: PortAssignments::default(),
            status: InstanceStatus::Stopped,
            graph_pid: None,
            timeseries_pid: None,
        }
    }

    pub fn pid(&self, engine: EngineKind) -> Option<u32> {
        match engine {
            EngineKind::Graph => self.graph_pid,
            EngineKind::Timeseries => self.timeseries_pid,
        }
    }

    pub fn has_any_pid(&self) -> bool {
        self.graph_pid.is_some() || self.timeseries_pid.is_some()
    }

    pub fn clear_pids(&mut self) {
        self.graph_pid = None;
        self.timeseries_pid = None;
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            name: self.name.clone(),
            status: self.status,
            ports: self
                .ports
                .iter()
                .map(|(role, port)| (role.as_str().to_string(), port))
                .collect(),
            graph_pid: self.graph_pid,
            timeseries_pid: self.timeseries_pid,
        }
    }
}

/// Read model handed to API consumers.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct InstanceSummary {
    pub name: String,
    pub status: InstanceStatus,
    pub ports: BTreeMap<String, u16>,
    pub graph_pid: Option<u32>,
    pub timeseries_pid: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigned_port_is_not_overwritten() {
        let mut ports = PortAssignments::default();
        assert!(ports.assign(PortRole::GraphHttp, 7400));
        assert!(!ports.assign(PortRole::GraphHttp, 7500));
        assert_eq!(ports.get(PortRole::GraphHttp), Some(7400));
    }

    #[test]
    fn missing_roles_follow_allocation_order() {
        let mut ports = PortAssignments::default();
        ports.assign(PortRole::GraphHttps, 7401);
        let missing: Vec<_> = ports.missing().collect();
        assert_eq!(missing.len(), 7);
        assert_eq!(missing[0], PortRole::GraphHttp);
        assert_eq!(missing[1], PortRole::GraphBolt);
        assert!(!ports.is_complete());
    }

    #[test]
    fn role_names_parse_back() {
        for role in PortRole::ALL {
            assert_eq!(role.as_str().parse::<PortRole>(), Ok(role));
        }
        assert_eq!("Graph-Bolt".parse::<PortRole>(), Ok(PortRole::GraphBolt));
        assert_eq!(
            "bolt".parse::<PortRole>(),
            Err(UnknownPortRole("bolt".to_string()))
        );
    }

    #[test]
    fn role_engine_split() {
        let graph = PortRole::ALL
            .iter()
            .filter(|r| r.engine() == EngineKind::Graph)
            .count();
        assert_eq!(graph, 4);
    }

    #[test]
    fn instance_record_uses_snake_case_keys() {
        let mut inst = Instance::new("corpusA");
        inst.ports.assign(PortRole::TimeseriesUdp, 8402);
        inst.status = InstanceStatus::Running;
        let json = serde_json::to_value(&inst).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["ports"]["timeseries_udp"], 8402);

        let back: Instance = serde_json::from_value(json).unwrap();
        assert_eq!(back, inst);
    }

    #[test]
    fn old_records_without_pids_still_load() {
        let raw = r#"{"name":"legacy","ports":{}}"#;
        let inst: Instance = serde_json::from_str(raw).unwrap();
        assert_eq!(inst.status, InstanceStatus::Stopped);
        assert!(!inst.has_any_pid());
    }
}
