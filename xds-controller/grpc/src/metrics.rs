use kato_xds_controller_core::ResourceType;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Discovery service metrics, labeled by RPC and by the resource type served.
#[derive(Clone, Debug)]
pub struct GrpcServerMetricsFamily {
    started: Family<RpcLabels, Counter>,
    handled: Family<CodeLabels, Counter>,
    open_streams: Family<RpcLabels, Gauge>,
    responses: Family<TypeLabels, Counter>,
    rejected: Family<TypeLabels, Counter>,
}

/// Records the lifetime of a single RPC. Dropping an observer that was not
/// explicitly ended counts the RPC as OK.
#[derive(Debug)]
pub(crate) struct ResponseObserver {
    labels: RpcLabels,
    handled: Family<CodeLabels, Counter>,
    responses: Family<TypeLabels, Counter>,
    rejected: Family<TypeLabels, Counter>,
    open: Option<Gauge>,
    ended: bool,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RpcLabels {
    grpc_service: &'static str,
    grpc_method: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CodeLabels {
    grpc_service: &'static str,
    grpc_method: &'static str,
    grpc_code: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TypeLabels {
    type_url: &'static str,
}

// === impl GrpcServerMetricsFamily ===

impl GrpcServerMetricsFamily {
    pub fn register(reg: &mut Registry) -> Self {
        let started = Family::<RpcLabels, Counter>::default();
        reg.register(
            "started",
            "Total number of discovery RPCs started",
            started.clone(),
        );

        let handled = Family::<CodeLabels, Counter>::default();
        reg.register(
            "handled",
            "Total number of discovery RPCs completed, by status code",
            handled.clone(),
        );

        let open_streams = Family::<RpcLabels, Gauge>::default();
        reg.register(
            "open_streams",
            "Number of discovery streams currently open",
            open_streams.clone(),
        );

        let responses = Family::<TypeLabels, Counter>::default();
        reg.register(
            "responses",
            "Total number of discovery responses sent to sidecars",
            responses.clone(),
        );

        let rejected = Family::<TypeLabels, Counter>::default();
        reg.register(
            "rejected",
            "Total number of configurations rejected by sidecars",
            rejected.clone(),
        );

        Self {
            started,
            handled,
            open_streams,
            responses,
            rejected,
        }
    }

    pub(crate) fn start_unary(
        &self,
        grpc_service: &'static str,
        grpc_method: &'static str,
    ) -> ResponseObserver {
        self.start(grpc_service, grpc_method, false)
    }

    pub(crate) fn start_stream(
        &self,
        grpc_service: &'static str,
        grpc_method: &'static str,
    ) -> ResponseObserver {
        self.start(grpc_service, grpc_method, true)
    }

    fn start(
        &self,
        grpc_service: &'static str,
        grpc_method: &'static str,
        stream: bool,
    ) -> ResponseObserver {
        let labels = RpcLabels {
            grpc_service,
            grpc_method,
        };
        self.started.get_or_create(&labels).inc();
        let open = stream.then(|| {
            let gauge = self.open_streams.get_or_create(&labels).clone();
            gauge.inc();
            gauge
        });
        ResponseObserver {
            labels,
            handled: self.handled.clone(),
            responses: self.responses.clone(),
            rejected: self.rejected.clone(),
            open,
            ended: false,
        }
    }
}

// === impl ResponseObserver ===

impl ResponseObserver {
    pub(crate) fn sent(&self, ty: ResourceType) {
        self.responses
            .get_or_create(&TypeLabels {
                type_url: ty.type_url(),
            })
            .inc();
    }

    pub(crate) fn rejected(&self, ty: ResourceType) {
        self.rejected
            .get_or_create(&TypeLabels {
                type_url: ty.type_url(),
            })
            .inc();
    }

    /// Completes the RPC with the given status. Later calls have no effect.
    pub(crate) fn end(&mut self, code: tonic::Code) {
        if std::mem::replace(&mut self.ended, true) {
            return;
        }
        if let Some(open) = self.open.take() {
            open.dec();
        }
        self.handled
            .get_or_create(&CodeLabels {
                grpc_service: self.labels.grpc_service,
                grpc_method: self.labels.grpc_method,
                grpc_code: format!("{code:?}"),
            })
            .inc();
    }
}

impl Drop for ResponseObserver {
    fn drop(&mut self) {
        self.end(tonic::Code::Ok);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    fn metrics() -> (Registry, GrpcServerMetricsFamily) {
        let mut reg = Registry::default();
        let metrics = GrpcServerMetricsFamily::register(&mut reg);
        (reg, metrics)
    }

    fn render(reg: &Registry) -> String {
        let mut out = String::new();
        encode(&mut out, reg).expect("metrics must encode");
        out
    }

    #[test]
    fn streams_are_gauged_while_open() {
        let (reg, metrics) = metrics();
        let observer = metrics.start_stream("ads", "Stream");
        observer.sent(ResourceType::Cluster);
        observer.rejected(ResourceType::Cluster);
        assert!(render(&reg).contains(r#"open_streams{grpc_service="ads",grpc_method="Stream"} 1"#));

        drop(observer);
        let out = render(&reg);
        assert!(out.contains(r#"open_streams{grpc_service="ads",grpc_method="Stream"} 0"#));
        assert!(out.contains(
            r#"handled_total{grpc_service="ads",grpc_method="Stream",grpc_code="Ok"} 1"#
        ));
        assert!(out.contains(&format!(
            r#"responses_total{{type_url="{}"}} 1"#,
            ResourceType::Cluster.type_url()
        )));
        assert!(out.contains(&format!(
            r#"rejected_total{{type_url="{}"}} 1"#,
            ResourceType::Cluster.type_url()
        )));
    }

    #[test]
    fn failed_rpcs_record_their_code_once() {
        let (reg, metrics) = metrics();
        metrics
            .start_unary("cds", "Fetch")
            .end(tonic::Code::InvalidArgument);
        let out = render(&reg);
        assert!(out.contains(
            r#"handled_total{grpc_service="cds",grpc_method="Fetch",grpc_code="InvalidArgument"} 1"#
        ));
        assert!(!out.contains(r#"grpc_code="Ok""#));
        assert!(!out.contains("open_streams{"));
    }
}
