//! JSON stats and health HTTP endpoint.
//!
//! Grounded on `huginn-proxy-lib::telemetry::server::start_observability_server`: a
//! dedicated `TcpListener` accept loop, `hyper::service::service_fn` routing by path, and
//! `hyper_util`'s auto connection builder, torn down via `tokio::select!` on a shutdown
//! signal instead of running forever. Two differences from that teacher: this endpoint
//! serves JSON bodies (`serde_json`) rather than a Prometheus registry, and shutdown is
//! driven by the supervisor's own `ctrlc`-triggered flag (via a `watch` channel) rather
//! than the process's own SIGTERM/SIGINT handlers, since the supervisor already owns
//! signal handling for the whole process.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::stats::SharedStats;

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    resp
}

async fn route(
    req: Request<Incoming>,
    stats: Arc<SharedStats>,
    started: Instant,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let uptime_secs = started.elapsed().as_secs();

    if path == "/health" {
        return Ok(json_response(
            StatusCode::OK,
            json!({ "status": "ok", "uptime_secs": uptime_secs }),
        ));
    }

    if path == "/stats" {
        let totals = stats.totals();
        let workers: serde_json::Map<String, serde_json::Value> = stats
            .snapshots()
            .into_iter()
            .map(|s| (format!("queue_{}", s.queue_id), serde_json::to_value(s).unwrap()))
            .collect();
        return Ok(json_response(
            StatusCode::OK,
            json!({
                "uptime_secs": uptime_secs,
                "totals": totals,
                "workers": workers,
            }),
        ));
    }

    if let Some(rest) = path.strip_prefix("/stats/") {
        return match rest.parse::<u32>() {
            Ok(queue_id) => match stats.get(queue_id) {
                Some(snapshot) => Ok(json_response(StatusCode::OK, serde_json::to_value(snapshot).unwrap())),
                None => Ok(json_response(
                    StatusCode::NOT_FOUND,
                    json!({ "error": format!("no worker for queue {queue_id}") }),
                )),
            },
            Err(_) => Ok(json_response(
                StatusCode::BAD_REQUEST,
                json!({ "error": "queue id must be an integer" }),
            )),
        };
    }

    Ok(json_response(StatusCode::NOT_FOUND, json!({ "error": "not found" })))
}

/// Serves the stats/health endpoint until `shutdown` reports `true`.
pub async fn run(addr: SocketAddr, stats: Arc<SharedStats>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let started = Instant::now();
    log::info!("stats endpoint listening on {addr}");

    let mut shutdown = shutdown;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    log::info!("stats endpoint shutting down");
                    break;
                }
            }
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("stats endpoint accept error: {e}");
                        continue;
                    }
                };
                let stats = stats.clone();
                tokio::spawn(async move {
                    let svc = hyper::service::service_fn(move |req| route(req, stats.clone(), started));
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(e) = builder.serve_connection(TokioIo::new(stream), svc).await {
                        log::debug!("stats endpoint connection from {peer} ended: {e}");
                    }
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::WorkerStats;

    #[test]
    fn json_response_sets_content_type_and_status() {
        let resp = json_response(StatusCode::NOT_FOUND, json!({ "error": "nope" }));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn stats_totals_aggregate_worker_snapshots() {
        let shared = SharedStats::new(2);
        let mut a = WorkerStats::default();
        a.packets_processed = 2;
        let mut b = WorkerStats::default();
        b.packets_processed = 5;
        shared.publish(a.snapshot(0));
        shared.publish(b.snapshot(1));
        assert_eq!(shared.totals().packets_processed, 7);
        assert_eq!(shared.snapshots().len(), 2);
    }
}
