use std::{fmt, str::FromStr};

/// Identifies a single sidecar.
///
/// Sidecars announce themselves by setting both `node.id` and `node.cluster` to
/// `<namespace>_<plugin_id>_<service_alias>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdentity {
    pub namespace: String,
    pub plugin_id: String,
    pub service_alias: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid node identity {0:?}: expected <namespace>_<plugin>_<alias>")]
pub struct InvalidIdentity(String);

// === impl NodeIdentity ===

impl NodeIdentity {
    pub fn new(
        namespace: impl Into<String>,
        plugin_id: impl Into<String>,
        service_alias: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            plugin_id: plugin_id.into(),
            service_alias: service_alias.into(),
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.namespace, self.plugin_id, self.service_alias
        )
    }
}

impl FromStr for NodeIdentity {
    type Err = InvalidIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Namespaces and plugin ids never contain underscores; aliases might.
        let mut parts = s.splitn(3, '_');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(plugin), Some(alias))
                if !ns.is_empty() && !plugin.is_empty() && !alias.is_empty() =>
            {
                Ok(Self::new(ns, plugin, alias))
            }
            _ => Err(InvalidIdentity(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_and_parses() {
        let id = NodeIdentity::new("tenant", "plugin01", "gr12ab");
        assert_eq!(id.to_string(), "tenant_plugin01_gr12ab");
        assert_eq!("tenant_plugin01_gr12ab".parse::<NodeIdentity>(), Ok(id));
    }

    #[test]
    fn alias_keeps_underscores() {
        let id = "ns_plugin_my_alias".parse::<NodeIdentity>().unwrap();
        assert_eq!(id.service_alias, "my_alias");
    }

    #[test]
    fn rejects_short_names() {
        assert!("ns_plugin".parse::<NodeIdentity>().is_err());
        assert!("ns__alias".parse::<NodeIdentity>().is_err());
        assert!("".parse::<NodeIdentity>().is_err());
    }
}
