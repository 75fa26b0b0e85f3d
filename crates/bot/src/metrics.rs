use crate::notifier::AlertOutcome;
use anyhow::Result;
use clonewatch_chain::FeedMetrics;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

pub const LIVENESS_BODY: &str = "clonewatch is running";

pub struct WatcherMetrics {
    registry: Registry,
    pub feed: FeedMetrics,
    pub blocks_processed: IntCounter,
    pub stale_blocks: IntCounter,
    pub block_failures: IntCounter,
    pub blocks_dropped: IntCounter,
    pub deployments_total: IntCounter,
    pub sources_unavailable: IntCounter,
    pub pipeline_dropped: IntCounter,
    pub alerts_total: IntCounterVec,
}

impl WatcherMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let feed = FeedMetrics::new(&registry)?;
        let blocks_processed = counter(
            &registry,
            "clonewatch_blocks_processed_total",
            "Blocks accepted from the feed and scanned",
        )?;
        let stale_blocks = counter(
            &registry,
            "clonewatch_stale_blocks_total",
            "Block notifications at or below the checkpoint",
        )?;
        let block_failures = counter(
            &registry,
            "clonewatch_block_failures_total",
            "Blocks whose body could not be retrieved",
        )?;
        let blocks_dropped = counter(
            &registry,
            "clonewatch_blocks_dropped_total",
            "Checkpointed blocks dropped because the block queue was full",
        )?;
        let deployments_total = counter(
            &registry,
            "clonewatch_deployments_total",
            "Contract deployments resolved from receipts",
        )?;
        let sources_unavailable = counter(
            &registry,
            "clonewatch_sources_unavailable_total",
            "Deployments without usable verified source",
        )?;
        let pipeline_dropped = counter(
            &registry,
            "clonewatch_pipeline_dropped_total",
            "Deployments dropped because too many were already in flight",
        )?;
        let alerts_total = IntCounterVec::new(
            Opts::new("clonewatch_alerts_total", "Similarity alerts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(alerts_total.clone()))?;

        Ok(Self {
            registry,
            feed,
            blocks_processed,
            stale_blocks,
            block_failures,
            blocks_dropped,
            deployments_total,
            sources_unavailable,
            pipeline_dropped,
            alerts_total,
        })
    }

    pub fn record_alert(&self, outcome: AlertOutcome) {
        let label = match outcome {
            AlertOutcome::Delivered => "delivered",
            AlertOutcome::LoggedOnly => "logged",
            AlertOutcome::Failed => "failed",
        };
        self.alerts_total.with_label_values(&[label]).inc();
    }

    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        let _ = encoder.encode(&families, &mut buf);
        String::from_utf8_lossy(&buf).to_string()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Serves `GET /` and, when metrics are on, `GET /metrics` from a plain thread.
pub fn spawn_liveness_server(
    bind: &str,
    metrics: Option<Arc<WatcherMetrics>>,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(bind)?;
    let local = listener.local_addr()?;
    thread::spawn(move || {
        info!(bind = %local, metrics = metrics.is_some(), "liveness server listening");
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(err) = handle_connection(stream, metrics.as_deref()) {
                        warn!(?err, "liveness server connection failed");
                    }
                }
                Err(err) => {
                    warn!(?err, "liveness server accept failed");
                }
            }
        }
    });
    Ok(local)
}

fn handle_connection(mut stream: TcpStream, metrics: Option<&WatcherMetrics>) -> Result<()> {
    let mut buffer = [0u8; 512];
    let n = stream.read(&mut buffer)?;
    let request = String::from_utf8_lossy(&buffer[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");
    let (status, content_type, body) = match (path, metrics) {
        ("/", _) => ("200 OK", "text/plain", LIVENESS_BODY.to_string()),
        ("/metrics", Some(metrics)) => (
            "200 OK",
            "text/plain; version=0.0.4",
            metrics.gather(),
        ),
        _ => ("404 Not Found", "text/plain", "not found".to_string()),
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())?;
    Ok(())
}
