use crate::channel::{tracked_channel, TrackedReceiver, TrackedSender};
use crate::metrics::FeedMetrics;
use crate::reconnect::{Feed, FeedError, ReconnectConfig, ReconnectState, ReconnectSupervisor};
use alloy::primitives::B256;
use alloy::providers::{DynProvider, Provider};
use alloy::pubsub::SubscriptionStream;
use alloy::rpc::types::Header;
use futures_util::StreamExt;
use std::future::Future;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub enum FeedEvent {
    Block(u64),
    /// The feed gave up; nothing follows this event.
    Fatal(FeedError),
}

pub trait BlockFeed: Feed {
    /// Next block number, or `None` once the subscription has ended.
    fn next_block(&mut self) -> impl Future<Output = Option<u64>> + Send;
}

/// `eth_subscribe("newHeads")` on a websocket provider.
pub struct HeadsFeed {
    provider: DynProvider,
    active: Option<(B256, SubscriptionStream<Header>)>,
}

impl HeadsFeed {
    pub fn new(provider: DynProvider) -> Self {
        Self {
            provider,
            active: None,
        }
    }
}

impl Feed for HeadsFeed {
    async fn stop(&mut self) -> Result<(), FeedError> {
        let Some((id, stream)) = self.active.take() else {
            return Ok(());
        };
        drop(stream);
        self.provider
            .unsubscribe(id)
            .await
            .map_err(|err| FeedError::from_rpc(&err))
    }

    async fn resume(&mut self) -> Result<(), FeedError> {
        let sub = self
            .provider
            .subscribe_blocks()
            .await
            .map_err(|err| FeedError::from_rpc(&err))?;
        let id = *sub.local_id();
        self.active = Some((id, sub.into_stream()));
        Ok(())
    }
}

impl BlockFeed for HeadsFeed {
    async fn next_block(&mut self) -> Option<u64> {
        let (_, stream) = self.active.as_mut()?;
        stream.next().await.map(|header| header.inner.number)
    }
}

pub struct NewHeadStream {
    provider: DynProvider,
    channel_size: usize,
    reconnect: ReconnectConfig,
    metrics: Option<FeedMetrics>,
}

impl NewHeadStream {
    pub fn new(
        provider: DynProvider,
        channel_size: usize,
        reconnect: ReconnectConfig,
        metrics: Option<FeedMetrics>,
    ) -> Self {
        Self {
            provider,
            channel_size,
            reconnect,
            metrics,
        }
    }

    pub fn spawn(self) -> TrackedReceiver<FeedEvent> {
        let (tx, rx) = tracked_channel(self.channel_size, self.metrics.clone());
        let feed = HeadsFeed::new(self.provider);
        let supervisor = ReconnectSupervisor::new(self.reconnect);
        tokio::spawn(drive(feed, supervisor, tx, self.metrics));
        rx
    }
}

/// Subscribes, forwards block numbers, and hands every feed error to the
/// supervisor until the receiver goes away or the feed turns fatal.
pub async fn drive<F: BlockFeed>(
    mut feed: F,
    mut supervisor: ReconnectSupervisor,
    tx: TrackedSender<FeedEvent>,
    metrics: Option<FeedMetrics>,
) {
    let mut pending = feed.resume().await.err();
    loop {
        if let Some(err) = pending.take() {
            warn!(kind = err.kind.as_str(), error = %err.message, "block feed error");
            if let Some(metrics) = &metrics {
                metrics.inc_error(err.kind);
            }
            let transition = supervisor.handle_error(&mut feed, &err).await;
            match transition.state {
                ReconnectState::Connected => {
                    if let Some(metrics) = &metrics {
                        metrics.inc_reconnect();
                    }
                }
                ReconnectState::Fatal => {
                    let cause = transition.resume_error.unwrap_or(err);
                    error!(error = %cause, "block feed is unrecoverable");
                    let _ = tx.send(FeedEvent::Fatal(cause)).await;
                    return;
                }
                ReconnectState::ReconnectingBackoff | ReconnectState::ReconnectingFixedDelay => {
                    pending = Some(transition.resume_error.unwrap_or(err));
                    continue;
                }
            }
        }

        match feed.next_block().await {
            Some(number) => {
                debug!(block = number, "new head");
                if tx.send(FeedEvent::Block(number)).await.is_err() {
                    warn!("block feed receiver dropped");
                    return;
                }
            }
            None => {
                pending = Some(FeedError::transient("new heads subscription ended"));
            }
        }
    }
}
