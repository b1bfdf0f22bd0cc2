use serde::{Deserialize, Serialize};
use std::fmt;

pub mod cluster;
pub mod pod;

pub use cluster::*;
pub use pod::*;

/// Stable identity of an InnoDB Cluster resource.
///
/// All cross references between clusters, pods and controllers go through
/// this key; nothing in the core holds object graphs.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct ClusterKey {
    /// Namespace of the cluster resource.
    pub namespace: String,
    /// Name of the cluster resource.
    pub name: String,
}

impl ClusterKey {
    /// Return a new `Self` from the given namespace and name.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// The Group Replication cluster name derived from the resource name.
    /// GR names cannot contain `-` or `.`, both valid in k8s names.
    pub fn group_name(&self) -> String {
        self.name.replace('-', "_").replace('.', "_")
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_name_is_gr_compatible() {
        let key = ClusterKey::new("prod", "my-cluster.v2");
        assert_eq!(key.group_name(), "my_cluster_v2");
        assert_eq!(key.to_string(), "prod/my-cluster.v2");
    }
}
