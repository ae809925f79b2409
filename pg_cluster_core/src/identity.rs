//! Node identity and the expected node set
//!
//! Nodes are ordered by the numeric ordinal the orchestrator appends to pod
//! and unit names (`postgresql-2`, `postgresql/2`). That order decides who
//! bootstraps a fresh cluster.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

/// Parse the trailing ordinal of a pod (`app-3`) or unit (`app/3`) name
pub fn parse_ordinal(name: &str) -> Option<u32> {
    let suffix = name.rsplit(|c| c == '-' || c == '/').next()?;
    if suffix.len() == name.len() {
        return None;
    }
    suffix.parse().ok()
}

/// Stable per-node hostname, resolved through the node's discovery Service
pub fn pod_hostname(app: &str, pod_name: &str) -> String {
    format!("{}-{}", app, pod_name)
}

/// Identity of the node this process runs on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Ordinal taken from the pod name
    pub index: u32,
    /// Pod name
    pub name: String,
    /// Stable hostname other nodes use to reach this one
    pub hostname: String,
    /// PostgreSQL data directory
    pub data_dir: PathBuf,
}

impl NodeIdentity {
    /// Build the identity of a pod belonging to `app`
    pub fn new(app: &str, pod_name: &str, data_dir: PathBuf) -> Option<Self> {
        let index = parse_ordinal(pod_name)?;
        Some(Self {
            index,
            name: pod_name.to_string(),
            hostname: pod_hostname(app, pod_name),
            data_dir,
        })
    }

    /// repmgr node id; repmgr rejects 0
    pub fn repmgr_node_id(&self) -> u32 {
        self.index + 1
    }

    /// Orchestrator unit name (`app/N`)
    pub fn unit_name(&self, app: &str) -> String {
        format!("{}/{}", app, self.index)
    }
}

impl Ord for NodeIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index
            .cmp(&other.index)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for NodeIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.name, self.index)
    }
}

/// Units the deployment currently declares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedNodeSet {
    units: Vec<String>,
}

impl ExpectedNodeSet {
    /// Build from a list of unit names
    pub fn new(units: Vec<String>) -> Self {
        Self { units }
    }

    /// Parse the space-separated form found in the environment
    pub fn parse(value: &str) -> Self {
        Self::new(value.split_whitespace().map(str::to_string).collect())
    }

    /// Number of declared units
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Declared unit names, in declaration order
    pub fn units(&self) -> &[String] {
        &self.units
    }

    /// Lowest ordinal among the declared units; the bootstrap primary
    pub fn canonical_first(&self) -> Option<u32> {
        self.units.iter().filter_map(|u| parse_ordinal(u)).min()
    }

    /// Whether `node` is the bootstrap primary of this set
    pub fn is_canonical_first(&self, node: &NodeIdentity) -> bool {
        self.canonical_first() == Some(node.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeIdentity {
        NodeIdentity::new("pg", name, PathBuf::from("/srv/pgdata")).unwrap()
    }

    #[test]
    fn test_parse_ordinal() {
        assert_eq!(parse_ordinal("postgresql-0"), Some(0));
        assert_eq!(parse_ordinal("my-app-12"), Some(12));
        assert_eq!(parse_ordinal("postgresql/7"), Some(7));
        assert_eq!(parse_ordinal("postgresql"), None);
        assert_eq!(parse_ordinal("postgresql-x"), None);
    }

    #[test]
    fn test_identity_fields() {
        let n = node("pg-2");
        assert_eq!(n.index, 2);
        assert_eq!(n.repmgr_node_id(), 3);
        assert_eq!(n.hostname, "pg-pg-2");
        assert_eq!(n.unit_name("pg"), "pg/2");
    }

    #[test]
    fn test_identity_order_is_numeric() {
        let mut nodes = vec![node("pg-10"), node("pg-2"), node("pg-0")];
        nodes.sort();
        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["pg-0", "pg-2", "pg-10"]);
    }

    #[test]
    fn test_canonical_first_uses_numeric_order() {
        // String order would pick pg/10
        let set = ExpectedNodeSet::parse("pg/10 pg/9 pg/11");
        assert_eq!(set.len(), 3);
        assert_eq!(set.canonical_first(), Some(9));
        assert!(set.is_canonical_first(&node("pg-9")));
        assert!(!set.is_canonical_first(&node("pg-10")));
    }

    #[test]
    fn test_empty_expected_set() {
        let set = ExpectedNodeSet::parse("   ");
        assert!(set.is_empty());
        assert_eq!(set.canonical_first(), None);
        assert!(!set.is_canonical_first(&node("pg-0")));
    }
}
