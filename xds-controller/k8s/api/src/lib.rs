#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod mesh;

pub use self::{
    labels::Selector,
    mesh::{EndpointGroup, MeshEndpoints, MeshService, PluginConfigMap, Protocol, ServiceType},
};
pub use k8s_openapi::api::{
    self,
    core::v1::{
        ConfigMap, EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service,
        ServicePort, ServiceSpec,
    },
};
pub use kube::{
    api::{ObjectMeta, ResourceExt},
    runtime::watcher,
    Client, Resource,
};

/// Returns true if an Endpoints update changes anything the mesh consumes.
///
/// Endpoints are rewritten by controllers for reasons unrelated to their
/// addresses; only subset changes are relevant.
pub fn endpoints_changed(old: &Endpoints, new: &Endpoints) -> bool {
    old.subsets != new.subsets
}

/// Returns true if a Service update is semantically meaningful.
pub fn service_changed(old: &Service, new: &Service) -> bool {
    old.metadata.labels != new.metadata.labels
        || old.metadata.annotations != new.metadata.annotations
        || old.spec != new.spec
}

/// Returns true if a ConfigMap update is semantically meaningful.
pub fn config_map_changed(old: &ConfigMap, new: &ConfigMap) -> bool {
    old.metadata.labels != new.metadata.labels || old.data != new.data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(ip: &str, resource_version: &str) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some("web".into()),
                resource_version: Some(resource_version.into()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: ip.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        }
    }

    #[test]
    fn endpoints_changes_only_consider_subsets() {
        assert!(!endpoints_changed(
            &endpoints("10.0.0.1", "1"),
            &endpoints("10.0.0.1", "2")
        ));
        assert!(endpoints_changed(
            &endpoints("10.0.0.1", "1"),
            &endpoints("10.0.0.2", "1")
        ));
    }

    #[test]
    fn service_status_is_ignored() {
        let svc = Service {
            metadata: ObjectMeta {
                name: Some("web".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut updated = svc.clone();
        updated.metadata.resource_version = Some("9".into());
        updated.status = Some(Default::default());
        assert!(!service_changed(&svc, &updated));

        updated.spec = Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port: 80,
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(service_changed(&svc, &updated));
    }
}
