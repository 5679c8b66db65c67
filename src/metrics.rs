use std::sync::OnceLock;

use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    header::CONTENT_TYPE,
    server::conn::http1,
    service::service_fn,
    Request, Response,
};
use hyper_util::rt::TokioIo;
use log::error;
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static PROVISIONED_CLAIMS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static RELEASED_VOLUMES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("reclaimable_pvc".to_string()), None)
            .expect("failed to initialise metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register metric collector");
    collector
}

fn reconciles_total() -> &'static IntCounterVec {
    RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "reconciles_total",
            "Reconcile invocations grouped by controller and resource",
        );
        let counter = IntCounterVec::new(opts, &["controller", "resource"])
            .expect("failed to build reconcile counter");
        register_collector(counter)
    })
}

fn provisioned_claims_total() -> &'static IntCounter {
    PROVISIONED_CLAIMS_TOTAL.get_or_init(|| {
        let counter = IntCounter::with_opts(Opts::new(
            "provisioned_claims_total",
            "PVCs created from pod annotations",
        ))
        .expect("failed to build provisioned claims counter");
        register_collector(counter)
    })
}

fn released_volumes_total() -> &'static IntCounter {
    RELEASED_VOLUMES_TOTAL.get_or_init(|| {
        let counter = IntCounter::with_opts(Opts::new(
            "released_volumes_total",
            "PVs returned to the Available phase",
        ))
        .expect("failed to build released volumes counter");
        register_collector(counter)
    })
}

pub(crate) fn record_reconcile(controller: &str, resource: &str) {
    reconciles_total()
        .with_label_values(&[controller, resource])
        .inc();
}

pub(crate) fn record_claim_provisioned() {
    provisioned_claims_total().inc();
}

pub(crate) fn record_volume_released() {
    released_volumes_total().inc();
}

/// Starts the Prometheus scrape endpoint on `addr`.
pub(crate) async fn init_metrics(addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tokio::spawn(async move {
        if let Err(e) = start_prometheus_metrics_server(listener).await {
            error!("metrics server failed: {}", e);
        }
    });
    Ok(())
}

async fn serve_req(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut result = Vec::new();
    match encoder.encode(&metric_families, &mut result) {
        Ok(_) => Response::builder()
            .status(200)
            .header(CONTENT_TYPE, encoder.format_type())
            .body(Full::new(Bytes::from(result))),
        Err(e) => {
            error!("{}", e);
            Response::builder()
                .status(500)
                .body(Full::new(Bytes::new()))
        }
    }
}

async fn start_prometheus_metrics_server(listener: TcpListener) -> anyhow::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(serve_req))
                .await
            {
                error!("error serving metrics connection: {:?}", err);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_surface_in_the_text_exposition() {
        record_reconcile("dynamic-pvc-provisioner", "pod");
        record_claim_provisioned();
        record_volume_released();

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&registry().gather(), &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("reclaimable_pvc_reconciles_total"));
        assert!(text.contains("controller=\"dynamic-pvc-provisioner\""));
        assert!(text.contains("reclaimable_pvc_provisioned_claims_total"));
        assert!(text.contains("reclaimable_pvc_released_volumes_total"));
    }
}
