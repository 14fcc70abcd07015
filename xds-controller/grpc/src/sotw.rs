//! State-of-the-world xDS stream handling.

use crate::{cache::SnapshotRx, metrics::ResponseObserver, SnapshotCache};
use futures::prelude::*;
use kato_xds_controller_core::{
    pb::envoy::{
        config::core::v3::ControlPlane,
        service::discovery::v3::{DiscoveryRequest, DiscoveryResponse},
    },
    ResourceType, Snapshot,
};
use std::{collections::BTreeMap, pin::Pin, sync::Arc};

pub(crate) type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, tonic::Status>> + Send>>;

pub(crate) const CONTROL_PLANE: &str = "kato-xds-controller";

/// Tracks what has been sent on a single stream.
#[derive(Debug)]
pub(crate) struct Session {
    node: Option<String>,

    /// Set for single-type services; aggregated streams carry any type.
    fixed: Option<ResourceType>,
    types: BTreeMap<ResourceType, Subscription>,
    nonce: u64,
}

#[derive(Debug, Default)]
struct Subscription {
    names: Vec<String>,
    version: Option<u64>,
    nonce: Option<String>,
}

/// Returns the key a sidecar's snapshots are published under.
pub(crate) fn node_key(req: &DiscoveryRequest) -> Option<String> {
    let node = req.node.as_ref()?;
    let key = if node.cluster.is_empty() {
        &node.id
    } else {
        &node.cluster
    };
    Some(key.clone()).filter(|k| !k.is_empty())
}

/// Serves a stream of discovery requests from the snapshot cache until the
/// client disconnects or the server shuts down.
pub(crate) fn response_stream<S>(
    cache: SnapshotCache,
    fixed: Option<ResourceType>,
    mut requests: S,
    drain: drain::Watch,
    observer: ResponseObserver,
) -> ResponseStream
where
    S: Stream<Item = Result<DiscoveryRequest, tonic::Status>> + Send + Unpin + 'static,
{
    Box::pin(async_stream::try_stream! {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        let mut observer = observer;
        let mut session = Session::new(fixed);
        let mut snapshots: Option<SnapshotRx> = None;

        loop {
            let responses = tokio::select! {
                req = requests.next() => match req {
                    Some(Ok(req)) => {
                        if req.error_detail.is_some() {
                            let ty = fixed.or_else(|| ResourceType::from_type_url(&req.type_url));
                            if let Some(ty) = ty {
                                observer.rejected(ty);
                            }
                        }
                        if snapshots.is_none() {
                            snapshots = node_key(&req).map(|node| cache.watch(&node));
                        }
                        let snapshot = snapshots
                            .as_mut()
                            .and_then(|rx| rx.borrow_and_update().clone());
                        session.on_stream_request(req, snapshot.as_deref())
                    }
                    Some(Err(status)) => {
                        tracing::debug!(node = ?session.node, %status, "Stream failed");
                        return;
                    }
                    None => return,
                },

                snapshot = next_snapshot(&mut snapshots) => match snapshot {
                    Some(snapshot) => Ok(session.on_snapshot(&snapshot)),
                    None => Ok(Vec::new()),
                },

                // Close the stream so that it doesn't hold the server open.
                _ = &mut shutdown => return,
            };

            let responses = responses.map_err(|status| {
                observer.end(status.code());
                status
            })?;
            for rsp in responses {
                if let Some(ty) = ResourceType::from_type_url(&rsp.type_url) {
                    observer.sent(ty);
                }
                yield rsp;
            }
        }
    })
}

/// Completes when the node's snapshot changes. Never completes if the node
/// is not yet known.
async fn next_snapshot(rx: &mut Option<SnapshotRx>) -> Option<Arc<Snapshot>> {
    let Some(rx) = rx else {
        return future::pending().await;
    };
    if rx.changed().await.is_err() {
        return future::pending().await;
    }
    rx.borrow_and_update().clone()
}

/// Builds the response to a unary fetch. Nodes without a snapshot receive an
/// empty response.
pub(crate) fn fetch(
    cache: &SnapshotCache,
    ty: ResourceType,
    req: DiscoveryRequest,
) -> Result<DiscoveryResponse, tonic::Status> {
    if !req.type_url.is_empty() && req.type_url != ty.type_url() {
        return Err(tonic::Status::invalid_argument(format!(
            "unexpected type URL {}",
            req.type_url
        )));
    }

    let snapshot = node_key(&req).and_then(|node| cache.get(&node));
    let Some(snapshot) = snapshot else {
        tracing::debug!(node = ?node_key(&req), type_url = ty.type_url(), "No snapshot");
        return Ok(DiscoveryResponse {
            type_url: ty.type_url().to_string(),
            control_plane: control_plane(),
            ..Default::default()
        });
    };

    let names = if ty.is_named() {
        req.resource_names
    } else {
        Vec::new()
    };
    Ok(DiscoveryResponse {
        version_info: snapshot.version_info(),
        resources: snapshot.resources(ty, &names),
        type_url: ty.type_url().to_string(),
        control_plane: control_plane(),
        ..Default::default()
    })
}

fn control_plane() -> Option<ControlPlane> {
    Some(ControlPlane {
        identifier: CONTROL_PLANE.to_string(),
    })
}

// === impl Session ===

impl Session {
    pub(crate) fn new(fixed: Option<ResourceType>) -> Self {
        Self {
            node: None,
            fixed,
            types: BTreeMap::new(),
            nonce: 0,
        }
    }

    /// Handles a request, returning a response if the client needs one.
    ///
    /// Stale requests and NACKs never produce a response; a NACKed version is
    /// not re-sent until the node's snapshot changes.
    pub(crate) fn on_request(
        &mut self,
        req: DiscoveryRequest,
        snapshot: Option<&Snapshot>,
    ) -> Result<Option<DiscoveryResponse>, tonic::Status> {
        if self.node.is_none() {
            self.node = node_key(&req);
        }
        let Some(ty) = self.resource_type(&req.type_url)? else {
            tracing::debug!(node = ?self.node, type_url = %req.type_url, "Ignoring unsupported type");
            return Ok(None);
        };
        let sub = self.types.entry(ty).or_default();

        if !req.response_nonce.is_empty() {
            if sub.nonce.as_deref() != Some(req.response_nonce.as_str()) {
                tracing::trace!(node = ?self.node, ?ty, nonce = %req.response_nonce, "Ignoring stale request");
                return Ok(None);
            }
            if let Some(error) = req.error_detail.as_ref() {
                tracing::warn!(
                    node = ?self.node,
                    ?ty,
                    version = %req.version_info,
                    code = error.code,
                    message = %error.message,
                    "Sidecar rejected configuration",
                );
                return Ok(None);
            }
        }

        let mut names = if ty.is_named() {
            req.resource_names
        } else {
            Vec::new()
        };
        names.sort();
        names.dedup();
        let resubscribed = sub.names != names;
        sub.names = names;
        let outdated = sub.version != snapshot.map(Snapshot::version);

        match snapshot {
            Some(snapshot) if resubscribed || outdated => Ok(Some(self.respond(ty, snapshot))),
            Some(_) => Ok(None),
            None => {
                tracing::debug!(node = ?self.node, ?ty, "Waiting for snapshot");
                Ok(None)
            }
        }
    }

    /// Handles a request on a stream that has observed `snapshot`.
    ///
    /// Observing a snapshot consumes its change notification, so every other
    /// subscribed type is brought up to date along with the requested one.
    pub(crate) fn on_stream_request(
        &mut self,
        req: DiscoveryRequest,
        snapshot: Option<&Snapshot>,
    ) -> Result<Vec<DiscoveryResponse>, tonic::Status> {
        let mut responses = self
            .on_request(req, snapshot)?
            .into_iter()
            .collect::<Vec<_>>();
        if let Some(snapshot) = snapshot {
            responses.extend(self.on_snapshot(snapshot));
        }
        Ok(responses)
    }

    /// Returns responses for every subscribed type that has not yet been sent
    /// the snapshot's version.
    pub(crate) fn on_snapshot(&mut self, snapshot: &Snapshot) -> Vec<DiscoveryResponse> {
        let outdated = self
            .types
            .iter()
            .filter(|(_, sub)| sub.version != Some(snapshot.version()))
            .map(|(ty, _)| *ty)
            .collect::<Vec<_>>();
        outdated
            .into_iter()
            .map(|ty| self.respond(ty, snapshot))
            .collect()
    }

    fn respond(&mut self, ty: ResourceType, snapshot: &Snapshot) -> DiscoveryResponse {
        self.nonce += 1;
        let nonce = self.nonce.to_string();
        let sub = self.types.entry(ty).or_default();
        sub.version = Some(snapshot.version());
        sub.nonce = Some(nonce.clone());

        let resources = snapshot.resources(ty, &sub.names);
        tracing::debug!(
            node = ?self.node,
            ?ty,
            version = snapshot.version(),
            resources = resources.len(),
            %nonce,
            "Sending",
        );
        DiscoveryResponse {
            version_info: snapshot.version_info(),
            resources,
            type_url: ty.type_url().to_string(),
            nonce,
            control_plane: control_plane(),
            ..Default::default()
        }
    }

    fn resource_type(&self, type_url: &str) -> Result<Option<ResourceType>, tonic::Status> {
        match (self.fixed, type_url) {
            (Some(fixed), "") => Ok(Some(fixed)),
            (None, "") => Err(tonic::Status::invalid_argument(
                "aggregated requests must set a type URL",
            )),
            (Some(fixed), url) if url == fixed.type_url() => Ok(Some(fixed)),
            (Some(_), url) => Err(tonic::Status::invalid_argument(format!(
                "unexpected type URL {url}"
            ))),
            (None, url) => Ok(ResourceType::from_type_url(url)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::GrpcServerMetricsFamily;
    use kato_xds_controller_core::{NodeIdentity, SnapshotSink};
    use prometheus_client::registry::Registry;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;
    use kato_xds_controller_core::pb::{
        envoy::config::{cluster::v3::Cluster, core::v3::Node, endpoint::v3::ClusterLoadAssignment},
        google::rpc::Status,
    };

    fn snapshot(version: u64) -> Snapshot {
        let cluster = |name: &str| Cluster {
            name: name.to_string(),
            ..Default::default()
        };
        let cla = |name: &str| ClusterLoadAssignment {
            cluster_name: name.to_string(),
            ..Default::default()
        };
        Snapshot::new(
            version,
            vec![],
            vec![cluster("a"), cluster("b")],
            vec![cla("a"), cla("b")],
            vec![],
        )
    }

    fn request(ty: ResourceType, nonce: &str, names: &[&str]) -> DiscoveryRequest {
        DiscoveryRequest {
            node: Some(Node {
                id: "ns_p1_web".to_string(),
                cluster: "ns_p1_web".to_string(),
                ..Default::default()
            }),
            type_url: ty.type_url().to_string(),
            response_nonce: nonce.to_string(),
            resource_names: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn next_response(rsps: &mut ResponseStream) -> DiscoveryResponse {
        tokio::time::timeout(std::time::Duration::from_secs(1), rsps.next())
            .await
            .expect("response must be sent")
            .expect("stream must be open")
            .expect("request must be valid")
    }

    #[test]
    fn acks_do_not_resend() {
        let mut session = Session::new(None);
        let s1 = snapshot(1);

        let rsp = session
            .on_request(request(ResourceType::Cluster, "", &[]), Some(&s1))
            .expect("valid request")
            .expect("initial request must be answered");
        assert_eq!(rsp.version_info, "version_1");
        assert_eq!(rsp.resources.len(), 2);

        let ack = session
            .on_request(request(ResourceType::Cluster, &rsp.nonce, &[]), Some(&s1))
            .expect("valid request");
        assert!(ack.is_none());

        let updates = session.on_snapshot(&snapshot(2));
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].version_info, "version_2");
        assert_ne!(updates[0].nonce, rsp.nonce);
    }

    #[test]
    fn nacks_and_stale_nonces_are_ignored() {
        let mut session = Session::new(Some(ResourceType::Cluster));
        let s1 = snapshot(1);
        let rsp = session
            .on_request(request(ResourceType::Cluster, "", &[]), Some(&s1))
            .expect("valid request")
            .expect("initial request must be answered");

        let mut nack = request(ResourceType::Cluster, &rsp.nonce, &[]);
        nack.error_detail = Some(Status {
            code: 3,
            message: "bad cluster".to_string(),
            ..Default::default()
        });
        assert!(session.on_request(nack, Some(&s1)).expect("valid").is_none());

        let stale = request(ResourceType::Cluster, "stale", &["x"]);
        assert!(session.on_request(stale, Some(&s1)).expect("valid").is_none());

        // Nothing is re-sent until the snapshot changes.
        assert!(session.on_snapshot(&s1).is_empty());
        assert_eq!(session.on_snapshot(&snapshot(2)).len(), 1);
    }

    #[test]
    fn named_types_filter_resources() {
        let mut session = Session::new(None);
        let s1 = snapshot(1);
        let rsp = session
            .on_request(request(ResourceType::Endpoint, "", &["b"]), Some(&s1))
            .expect("valid request")
            .expect("initial request must be answered");
        assert_eq!(rsp.resources.len(), 1);

        // Subscribing to more names triggers a response at the same version.
        let rsp = session
            .on_request(request(ResourceType::Endpoint, &rsp.nonce, &["a", "b"]), Some(&s1))
            .expect("valid request")
            .expect("resubscription must be answered");
        assert_eq!(rsp.version_info, "version_1");
        assert_eq!(rsp.resources.len(), 2);
    }

    #[test]
    fn waits_for_a_snapshot() {
        let mut session = Session::new(None);
        assert!(session
            .on_request(request(ResourceType::Listener, "", &[]), None)
            .expect("valid request")
            .is_none());
        let rsp = session.on_snapshot(&snapshot(1));
        assert_eq!(rsp.len(), 1);
        assert_eq!(rsp[0].type_url, ResourceType::Listener.type_url());
    }

    #[test]
    fn aggregated_requests_require_a_type() {
        let mut session = Session::new(None);
        let mut req = request(ResourceType::Cluster, "", &[]);
        req.type_url.clear();
        assert_eq!(
            session.on_request(req, None).expect_err("must fail").code(),
            tonic::Code::InvalidArgument
        );

        let mut session = Session::new(Some(ResourceType::Cluster));
        let req = request(ResourceType::Listener, "", &[]);
        assert!(session.on_request(req, None).is_err());
    }

    #[test]
    fn fetch_without_snapshot_is_empty() {
        let cache = SnapshotCache::default();
        let rsp = fetch(&cache, ResourceType::Cluster, request(ResourceType::Cluster, "", &[]))
            .expect("valid request");
        assert!(rsp.version_info.is_empty());
        assert!(rsp.resources.is_empty());
    }

    #[tokio::test]
    async fn streams_follow_published_snapshots() {
        let cache = SnapshotCache::default();
        let node = NodeIdentity::new("ns", "p1", "web");
        let metrics = GrpcServerMetricsFamily::register(&mut Registry::default());
        let (signal, drain) = drain::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rsps = response_stream(
            cache.clone(),
            Some(ResourceType::Cluster),
            UnboundedReceiverStream::new(rx).map(Ok::<_, tonic::Status>),
            drain,
            metrics.start_stream("test", "Stream"),
        );

        tx.send(request(ResourceType::Cluster, "", &[]))
            .expect("stream must be open");
        cache.set_snapshot(&node, snapshot(1)).expect("publish");
        let rsp = rsps
            .next()
            .await
            .expect("stream must be open")
            .expect("request must be valid");
        assert_eq!(rsp.version_info, "version_1");

        tx.send(request(ResourceType::Cluster, &rsp.nonce, &[]))
            .expect("stream must be open");
        cache.set_snapshot(&node, snapshot(2)).expect("publish");
        let rsp = rsps
            .next()
            .await
            .expect("stream must be open")
            .expect("request must be valid");
        assert_eq!(rsp.version_info, "version_2");

        let drained = tokio::spawn(signal.drain());
        assert!(rsps.next().await.is_none());
        drop(rsps);
        drained.await.expect("drain must complete");
    }

    #[test]
    fn requests_bring_every_type_up_to_date() {
        let mut session = Session::new(None);
        let s1 = snapshot(1);
        let cds = session
            .on_stream_request(request(ResourceType::Cluster, "", &[]), Some(&s1))
            .expect("valid request");
        let eds = session
            .on_stream_request(request(ResourceType::Endpoint, "", &[]), Some(&s1))
            .expect("valid request");
        assert!(session
            .on_stream_request(request(ResourceType::Cluster, &cds[0].nonce, &[]), Some(&s1))
            .expect("valid request")
            .is_empty());

        // The endpoint ACK arrives after the next snapshot was published.
        let rsps = session
            .on_stream_request(request(ResourceType::Endpoint, &eds[0].nonce, &[]), Some(&snapshot(2)))
            .expect("valid request");
        let versions = rsps
            .iter()
            .map(|r| (r.type_url.as_str(), r.version_info.as_str()))
            .collect::<BTreeMap<_, _>>();
        assert_eq!(
            versions,
            BTreeMap::from([
                (ResourceType::Cluster.type_url(), "version_2"),
                (ResourceType::Endpoint.type_url(), "version_2"),
            ])
        );
    }

    #[tokio::test]
    async fn aggregated_streams_update_every_type() {
        let cache = SnapshotCache::default();
        let node = NodeIdentity::new("ns", "p1", "web");
        let metrics = GrpcServerMetricsFamily::register(&mut Registry::default());
        let (_signal, drain) = drain::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rsps = response_stream(
            cache.clone(),
            None,
            UnboundedReceiverStream::new(rx).map(Ok::<_, tonic::Status>),
            drain,
            metrics.start_stream("test", "Stream"),
        );
        cache.set_snapshot(&node, snapshot(1)).expect("publish");
        tx.send(request(ResourceType::Cluster, "", &[])).expect("stream must be open");
        let cds = next_response(&mut rsps).await;
        tx.send(request(ResourceType::Endpoint, "", &[])).expect("stream must be open");
        let eds = next_response(&mut rsps).await;
        assert_eq!(eds.type_url, ResourceType::Endpoint.type_url());
        tx.send(request(ResourceType::Cluster, &cds.nonce, &[])).expect("stream must be open");

        // Publish while the endpoint ACK is still queued so that either may be
        // handled first.
        tx.send(request(ResourceType::Endpoint, &eds.nonce, &[])).expect("stream must be open");
        cache.set_snapshot(&node, snapshot(2)).expect("publish");

        let mut versions = BTreeMap::new();
        for _ in 0..2 {
            let rsp = next_response(&mut rsps).await;
            versions.insert(rsp.type_url, rsp.version_info);
        }
        assert_eq!(versions.get(ResourceType::Cluster.type_url()).map(String::as_str), Some("version_2"));
        assert_eq!(versions.get(ResourceType::Endpoint.type_url()).map(String::as_str), Some("version_2"));
    }

    #[tokio::test]
    async fn invalid_requests_end_the_stream() {
        let metrics = GrpcServerMetricsFamily::register(&mut Registry::default());
        let (_signal, drain) = drain::channel();
        let mut rsps = response_stream(
            SnapshotCache::default(),
            Some(ResourceType::Cluster),
            stream::iter(vec![
                Ok(request(ResourceType::Listener, "", &[])),
                Ok(request(ResourceType::Cluster, "", &[])),
            ]),
            drain,
            metrics.start_stream("test", "Stream"),
        );
        let status = rsps
            .next()
            .await
            .expect("stream must yield an error")
            .expect_err("request must be rejected");
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(rsps.next().await.is_none());
    }

    #[tokio::test]
    async fn streams_end_with_their_requests() {
        let metrics = GrpcServerMetricsFamily::register(&mut Registry::default());
        let (_signal, drain) = drain::channel();
        let mut rsps = response_stream(
            SnapshotCache::default(),
            None,
            stream::iter(vec![Ok(request(ResourceType::Listener, "", &[]))]),
            drain,
            metrics.start_stream("test", "Stream"),
        );
        assert!(rsps.next().await.is_none());
    }
}
