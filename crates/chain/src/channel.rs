use crate::metrics::FeedMetrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;

pub struct TrackedSender<T> {
    sender: mpsc::Sender<T>,
    len: Arc<AtomicUsize>,
    metrics: Option<FeedMetrics>,
}

pub struct TrackedReceiver<T> {
    receiver: mpsc::Receiver<T>,
    len: Arc<AtomicUsize>,
    metrics: Option<FeedMetrics>,
}

pub fn tracked_channel<T>(
    capacity: usize,
    metrics: Option<FeedMetrics>,
) -> (TrackedSender<T>, TrackedReceiver<T>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let len = Arc::new(AtomicUsize::new(0));
    let sender = TrackedSender { sender, len: len.clone(), metrics: metrics.clone() };
    let receiver = TrackedReceiver { receiver, len, metrics };
    (sender, receiver)
}

impl<T> TrackedSender<T> {
    /// Waits for capacity instead of dropping; block notifications are never shed.
    pub async fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.sender.send(value).await?;
        let len = self.len.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(len);
        }
        Ok(())
    }
}

impl<T> TrackedReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.receiver.recv().await;
        if item.is_some() {
            let _ = self.len.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                value.checked_sub(1)
            });
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(self.len.load(Ordering::SeqCst));
        }
        item
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
