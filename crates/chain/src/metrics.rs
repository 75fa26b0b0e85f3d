use anyhow::Result;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::reconnect::FeedErrorKind;

#[derive(Clone)]
pub struct FeedMetrics {
    queue_depth: IntGauge,
    errors_total: IntCounterVec,
    reconnects_total: IntCounter,
}

impl FeedMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let queue_depth = IntGauge::with_opts(Opts::new(
            "clonewatch_feed_queue_depth",
            "Block notifications waiting for the watcher",
        ))?;
        let errors_total = IntCounterVec::new(
            Opts::new("clonewatch_feed_errors_total", "Block feed errors by kind"),
            &["kind"],
        )?;
        let reconnects_total = IntCounter::with_opts(Opts::new(
            "clonewatch_feed_reconnects_total",
            "Successful block feed resumptions",
        ))?;

        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(reconnects_total.clone()))?;

        Ok(Self {
            queue_depth,
            errors_total,
            reconnects_total,
        })
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn inc_error(&self, kind: FeedErrorKind) {
        self.errors_total.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn inc_reconnect(&self) {
        self.reconnects_total.inc();
    }
}
