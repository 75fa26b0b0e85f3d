use crate::checkpoint::{CheckpointIOError, CheckpointStore};
use crate::metrics::{spawn_liveness_server, WatcherMetrics};
use crate::notifier::{AlertDispatcher, AlertOutcome, TelegramNotifier};
use anyhow::{Context, Result};
use clonewatch_chain::{
    BlockFetchError, ContractDetector, FeedError, FeedEvent, NewHeadStream, NodeClient,
    ReconnectConfig, TrackedReceiver,
};
use clonewatch_core::config::{AppConfig, WatcherConfig};
use clonewatch_core::types::{AlertMessage, Checkpoint, ContractDeployment};
use clonewatch_explorer::SourceFetcher;
use clonewatch_similarity::ReferenceTemplate;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::select;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

type ScanFuture = Pin<Box<dyn Future<Output = BlockScan> + Send>>;
type PipelineFuture = Pin<Box<dyn Future<Output = PipelineOutcome> + Send>>;
type CheckpointFlush = JoinHandle<(u64, Result<(), CheckpointIOError>)>;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("block feed is unrecoverable: {0}")]
    FeedFatal(#[source] FeedError),
    #[error("block feed closed")]
    FeedClosed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PipelineOutcome {
    SourceUnavailable,
    BelowThreshold { percent: f64 },
    Alerted { percent: f64, outcome: AlertOutcome },
}

struct BlockScan {
    number: u64,
    result: Result<Vec<ContractDeployment>, BlockFetchError>,
}

/// settle -> fetch source -> score -> alert, for one deployment.
///
/// Every deployment waits out its settle delay independently; only the
/// explorer lookups that follow are bounded by `explorer_permits`.
#[derive(Clone)]
pub struct ClonePipeline {
    fetcher: SourceFetcher,
    reference: Arc<ReferenceTemplate>,
    threshold: f64,
    alerts: AlertDispatcher,
    explorer_permits: Arc<Semaphore>,
    metrics: Option<Arc<WatcherMetrics>>,
}

impl ClonePipeline {
    pub fn new(
        fetcher: SourceFetcher,
        reference: Arc<ReferenceTemplate>,
        threshold: f64,
        alerts: AlertDispatcher,
        explorer_concurrency: usize,
        metrics: Option<Arc<WatcherMetrics>>,
    ) -> Self {
        Self {
            fetcher,
            reference,
            threshold,
            alerts,
            explorer_permits: Arc::new(Semaphore::new(explorer_concurrency.max(1))),
            metrics,
        }
    }

    pub async fn evaluate(&self, deployment: ContractDeployment) -> PipelineOutcome {
        let address = deployment.address;
        self.fetcher.settle(address).await;
        let fetched = match self.explorer_permits.acquire().await {
            Ok(_permit) => self.fetcher.fetch_now(address).await,
            Err(err) => {
                warn!(%address, %err, "explorer permits closed");
                return PipelineOutcome::SourceUnavailable;
            }
        };
        let bundle = match fetched {
            Ok(bundle) => bundle,
            Err(err) => {
                info!(%address, %err, "no verified source");
                if let Some(metrics) = &self.metrics {
                    metrics.sources_unavailable.inc();
                }
                return PipelineOutcome::SourceUnavailable;
            }
        };

        let result = self.reference.score(&bundle.text);
        info!(
            %address,
            block = deployment.block_number,
            percent = result.percent,
            matched = result.matched,
            total = result.total,
            "scored contract"
        );
        if !result.meets(self.threshold) {
            return PipelineOutcome::BelowThreshold {
                percent: result.percent,
            };
        }

        let alert = AlertMessage {
            address,
            percent: result.percent,
        };
        let outcome = self.alerts.send(&alert).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_alert(outcome);
        }
        PipelineOutcome::Alerted {
            percent: result.percent,
            outcome,
        }
    }
}

pub struct ChainWatcher {
    detector: ContractDetector,
    pipeline: ClonePipeline,
    checkpoint: CheckpointStore,
    last_block: u64,
    /// Accepted but not yet handed to a checkpoint write.
    unsaved_block: Option<u64>,
    concurrency: usize,
    queue_capacity: usize,
    metrics: Option<Arc<WatcherMetrics>>,
}

impl ChainWatcher {
    pub fn new(
        detector: ContractDetector,
        pipeline: ClonePipeline,
        cfg: &WatcherConfig,
        metrics: Option<Arc<WatcherMetrics>>,
    ) -> Self {
        let checkpoint = CheckpointStore::new(&cfg.checkpoint_path);
        let last_block = checkpoint.load().last_block;
        info!(
            path = %checkpoint.path().display(),
            last_block,
            "loaded checkpoint"
        );
        Self {
            detector,
            pipeline,
            checkpoint,
            last_block,
            unsaved_block: None,
            concurrency: cfg.pipeline_concurrency.max(1),
            queue_capacity: cfg.pipeline_queue_capacity,
            metrics,
        }
    }

    pub fn last_block(&self) -> u64 {
        self.last_block
    }

    /// Consumes block notifications until the feed turns fatal or closes.
    /// After a close, work already accepted is finished before returning.
    ///
    /// Block scans are bounded by `pipeline_concurrency` with overflow queued
    /// up to `pipeline_queue_capacity`. Deployments start their pipeline as
    /// soon as they are found, up to `pipeline_queue_capacity` in flight.
    pub async fn run(&mut self, mut heads: TrackedReceiver<FeedEvent>) -> Result<(), WatcherError> {
        let limit = self.concurrency;
        let mut block_queue: VecDeque<u64> = VecDeque::new();
        let mut scans: FuturesUnordered<ScanFuture> = FuturesUnordered::new();
        let mut pipelines: FuturesUnordered<PipelineFuture> = FuturesUnordered::new();
        let mut checkpoint_flush: Option<CheckpointFlush> = None;
        let mut feed_open = true;

        info!(last_block = self.last_block, "watcher running");
        loop {
            // the block queue only holds work while the scan set is full
            if !feed_open && scans.is_empty() && pipelines.is_empty() && checkpoint_flush.is_none() {
                return Err(WatcherError::FeedClosed);
            }
            select! {
                event = heads.recv(), if feed_open => match event {
                    Some(FeedEvent::Block(number)) => {
                        if !self.accept_block(number) {
                            continue;
                        }
                        self.start_checkpoint_flush(&mut checkpoint_flush);
                        if scans.len() < limit {
                            scans.push(self.scan(number));
                        } else if block_queue.len() < self.queue_capacity {
                            block_queue.push_back(number);
                        } else {
                            warn!(block = number, "block queue full; dropping block");
                            if let Some(metrics) = &self.metrics {
                                metrics.blocks_dropped.inc();
                            }
                        }
                    }
                    Some(FeedEvent::Fatal(err)) => {
                        error!(error = %err, "stopping watcher");
                        self.flush_checkpoint(checkpoint_flush.take()).await;
                        return Err(WatcherError::FeedFatal(err));
                    }
                    None => {
                        warn!("block feed closed; finishing in-flight work");
                        feed_open = false;
                    }
                },
                Some(scan) = scans.next(), if !scans.is_empty() => {
                    match scan.result {
                        Ok(deployments) => {
                            debug!(block = scan.number, deployments = deployments.len(), "block scanned");
                            for deployment in deployments {
                                info!(
                                    address = %deployment.address,
                                    tx = %deployment.tx_hash,
                                    block = deployment.block_number,
                                    "new contract"
                                );
                                if let Some(metrics) = &self.metrics {
                                    metrics.deployments_total.inc();
                                }
                                if pipelines.len() < self.queue_capacity {
                                    pipelines.push(self.evaluate(deployment));
                                } else {
                                    warn!(address = %deployment.address, "too many deployments in flight; dropping deployment");
                                    if let Some(metrics) = &self.metrics {
                                        metrics.pipeline_dropped.inc();
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            warn!(block = scan.number, %err, "block processing failed");
                            if let Some(metrics) = &self.metrics {
                                metrics.block_failures.inc();
                            }
                        }
                    }
                    while scans.len() < limit {
                        let Some(number) = block_queue.pop_front() else {
                            break;
                        };
                        scans.push(self.scan(number));
                    }
                }
                Some(outcome) = pipelines.next(), if !pipelines.is_empty() => {
                    debug!(?outcome, "pipeline finished");
                }
                result = async {
                    match checkpoint_flush.as_mut() {
                        Some(handle) => handle.await,
                        None => std::future::pending().await,
                    }
                }, if checkpoint_flush.is_some() => {
                    checkpoint_flush = None;
                    log_checkpoint_flush(result);
                    self.start_checkpoint_flush(&mut checkpoint_flush);
                }
            }
        }
    }

    /// Advances `last_block`; `false` for stale notifications.
    fn accept_block(&mut self, number: u64) -> bool {
        if number <= self.last_block {
            debug!(block = number, last_block = self.last_block, "stale block");
            if let Some(metrics) = &self.metrics {
                metrics.stale_blocks.inc();
            }
            return false;
        }
        self.last_block = number;
        self.unsaved_block = Some(number);
        if let Some(metrics) = &self.metrics {
            metrics.blocks_processed.inc();
        }
        true
    }

    /// One write at a time, off the runtime; a newer block supersedes any
    /// value still waiting for its turn.
    fn start_checkpoint_flush(&mut self, flush: &mut Option<CheckpointFlush>) {
        if flush.is_some() {
            return;
        }
        let Some(number) = self.unsaved_block.take() else {
            return;
        };
        let store = self.checkpoint.clone();
        *flush = Some(tokio::task::spawn_blocking(move || {
            (number, store.save(Checkpoint::new(number)))
        }));
    }

    async fn flush_checkpoint(&mut self, flush: Option<CheckpointFlush>) {
        if let Some(handle) = flush {
            log_checkpoint_flush(handle.await);
        }
        if let Some(number) = self.unsaved_block.take() {
            let store = self.checkpoint.clone();
            let result =
                tokio::task::spawn_blocking(move || (number, store.save(Checkpoint::new(number))))
                    .await;
            log_checkpoint_flush(result);
        }
    }

    fn scan(&self, number: u64) -> ScanFuture {
        let detector = self.detector.clone();
        Box::pin(async move {
            let result = match detector.find_deployments(number).await {
                Ok(deployments) => Ok(deployments.collect::<Vec<_>>().await),
                Err(err) => Err(err),
            };
            BlockScan { number, result }
        })
    }

    fn evaluate(&self, deployment: ContractDeployment) -> PipelineFuture {
        let pipeline = self.pipeline.clone();
        Box::pin(async move { pipeline.evaluate(deployment).await })
    }
}

fn log_checkpoint_flush(result: Result<(u64, Result<(), CheckpointIOError>), JoinError>) {
    match result {
        Ok((_, Ok(()))) => {}
        Ok((number, Err(err))) => error!(block = number, %err, "checkpoint save failed"),
        Err(err) => error!(?err, "checkpoint save task failed"),
    }
}

/// Wires every component from `cfg` and runs the watcher until the feed ends.
pub async fn launch(cfg: &AppConfig) -> Result<()> {
    let reference_text = std::fs::read_to_string(&cfg.similarity.reference_path)
        .with_context(|| format!("reading reference {}", cfg.similarity.reference_path))?;
    let reference = Arc::new(ReferenceTemplate::new(&reference_text)?);
    info!(
        path = %cfg.similarity.reference_path,
        lines = reference.line_count(),
        threshold = cfg.similarity.threshold,
        "reference template loaded"
    );

    let metrics = if cfg.observability.metrics_enabled {
        Some(Arc::new(WatcherMetrics::new()?))
    } else {
        None
    };
    spawn_liveness_server(&cfg.observability.liveness_bind, metrics.clone())
        .with_context(|| format!("binding liveness server {}", cfg.observability.liveness_bind))?;

    let chain = NodeClient::connect(&cfg.chain).await?;
    let fetcher = SourceFetcher::new(&cfg.explorer, cfg.chain.chain_id)?;
    let alerts = AlertDispatcher::new(TelegramNotifier::from_env(), cfg.explorer.address_url.clone());
    if !alerts.is_enabled() {
        warn!("telegram not configured; alerts will only be logged");
    }
    let pipeline = ClonePipeline::new(
        fetcher,
        reference,
        cfg.similarity.threshold,
        alerts,
        cfg.watcher.pipeline_concurrency,
        metrics.clone(),
    );
    let mut watcher = ChainWatcher::new(
        ContractDetector::new(chain.http.clone()),
        pipeline,
        &cfg.watcher,
        metrics.clone(),
    );

    let heads = NewHeadStream::new(
        chain.ws.clone(),
        cfg.feed.channel_size,
        ReconnectConfig::from_config(&cfg.feed),
        metrics.as_ref().map(|metrics| metrics.feed.clone()),
    )
    .spawn();
    watcher.run(heads).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::consensus::transaction::Recovered;
    use alloy::consensus::{Receipt, ReceiptEnvelope, Signed, TxEnvelope, TxLegacy, TxType};
    use alloy::primitives::{address, Address, Bytes, Signature, TxKind, B256, U256};
    use alloy::providers::{DynProvider, Provider, ProviderBuilder};
    use alloy::rpc::types::{Block, BlockTransactions, Header, Log, Transaction, TransactionReceipt};
    use alloy::transports::mock::Asserter;
    use clonewatch_chain::channel::tracked_channel;
    use clonewatch_chain::FeedErrorKind;
    use clonewatch_core::config::ExplorerConfig;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio::time::{timeout, Duration, Instant};

    const DEPLOYED: Address = address!("0xab00000000000000000000000000000000000001");

    fn build_tx(to: Option<Address>, hash: B256) -> Transaction {
        let legacy = TxLegacy {
            chain_id: Some(8453),
            nonce: 0,
            gas_price: 1,
            gas_limit: 3_000_000,
            to: to.map(TxKind::Call).unwrap_or(TxKind::Create),
            value: U256::ZERO,
            input: Bytes::from(vec![0x60, 0x80]),
        };
        let signature = Signature::from_bytes_and_parity(&[1u8; 64], false);
        Transaction {
            inner: Recovered::new_unchecked(
                TxEnvelope::Legacy(Signed::new_unchecked(legacy, signature, hash)),
                address!("0x1111111111111111111111111111111111111111"),
            ),
            block_hash: Some(B256::from([7u8; 32])),
            block_number: Some(100),
            transaction_index: Some(0),
            effective_gas_price: None,
        }
    }

    fn build_block(number: u64, txs: Vec<Transaction>) -> Block {
        Block {
            header: Header {
                hash: B256::from([7u8; 32]),
                inner: alloy::consensus::Header {
                    number,
                    ..Default::default()
                },
                total_difficulty: None,
                size: None,
            },
            uncles: Vec::new(),
            transactions: BlockTransactions::Full(txs),
            withdrawals: None,
        }
    }

    fn build_receipt(tx_hash: B256, contract_address: Address) -> TransactionReceipt {
        TransactionReceipt {
            inner: ReceiptEnvelope::from_typed(TxType::Legacy, Receipt::<Log>::default()),
            transaction_hash: tx_hash,
            transaction_index: Some(0),
            block_hash: Some(B256::from([7u8; 32])),
            block_number: Some(100),
            gas_used: 0,
            effective_gas_price: 0,
            blob_gas_used: None,
            blob_gas_price: None,
            from: Address::ZERO,
            to: None,
            contract_address: Some(contract_address),
        }
    }

    fn reference_text() -> String {
        (0..20)
            .map(|i| format!("uint256 public value{i};"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Source sharing `shared` of the 20 reference lines.
    fn candidate_text(shared: usize) -> String {
        let mut lines: Vec<String> = (0..shared).map(|i| format!("uint256 public value{i};")).collect();
        lines.push("// deployed by someone else".to_string());
        lines.push("uint256 public other;".to_string());
        lines.join("\n")
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request);
            let complete = text.split_once("\r\n\r\n").is_some_and(|(head, rest)| {
                let length = head
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                rest.len() >= length
            });
            if complete || n == 0 {
                break;
            }
        }
        String::from_utf8_lossy(&request).to_string()
    }

    async fn reply_json(stream: &mut TcpStream, body: &str) {
        let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(reply.as_bytes()).await.unwrap();
    }

    /// Answers one HTTP request with `body` and returns the raw request.
    async fn respond_once(body: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            reply_json(&mut stream, &body).await;
            request
        });
        (format!("http://{addr}"), handle)
    }

    /// Answers `count` requests with `body`; each arrival is measured from
    /// the moment the server was bound.
    async fn serve_many(count: usize, body: String) -> (String, JoinHandle<Vec<Duration>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            let mut arrivals = Vec::with_capacity(count);
            for _ in 0..count {
                let (mut stream, _) = listener.accept().await.unwrap();
                read_request(&mut stream).await;
                arrivals.push(started.elapsed());
                reply_json(&mut stream, &body).await;
            }
            arrivals
        });
        (format!("http://{addr}"), handle)
    }

    fn explorer_body(source: &str) -> String {
        serde_json::json!({
            "status": "1",
            "message": "OK",
            "result": [{ "SourceCode": source, "ContractName": "Token" }],
        })
        .to_string()
    }

    const UNVERIFIED: &str =
        r#"{"status":"0","message":"NOTOK","result":"Contract source code not verified"}"#;

    fn logged_alerts() -> AlertDispatcher {
        AlertDispatcher::new(None, "https://explorer/address/")
    }

    struct Options {
        settle_delay_ms: u64,
        concurrency: usize,
        capacity: usize,
    }

    impl Default for Options {
        fn default() -> Self {
            Self {
                settle_delay_ms: 0,
                concurrency: 4,
                capacity: 16,
            }
        }
    }

    struct Harness {
        asserter: Asserter,
        dir: TempDir,
        metrics: Arc<WatcherMetrics>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                asserter: Asserter::new(),
                dir: tempfile::tempdir().unwrap(),
                metrics: Arc::new(WatcherMetrics::new().unwrap()),
            }
        }

        fn checkpoint(&self) -> CheckpointStore {
            CheckpointStore::new(self.dir.path().join("state.json"))
        }

        fn mocked(&self) -> DynProvider {
            ProviderBuilder::new()
                .connect_mocked_client(self.asserter.clone())
                .erased()
        }

        fn watcher(&self, explorer_url: String, alerts: AlertDispatcher) -> ChainWatcher {
            self.watcher_with(self.mocked(), explorer_url, alerts, Options::default())
        }

        fn watcher_with(
            &self,
            provider: DynProvider,
            explorer_url: String,
            alerts: AlertDispatcher,
            options: Options,
        ) -> ChainWatcher {
            let explorer = ExplorerConfig {
                api_url: explorer_url,
                api_key_env: "CLONEWATCH_TEST_UNSET_KEY".to_string(),
                settle_delay_ms: options.settle_delay_ms,
                request_timeout_ms: 5_000,
                ..ExplorerConfig::default()
            };
            let pipeline = ClonePipeline::new(
                SourceFetcher::new(&explorer, 8453).unwrap(),
                Arc::new(ReferenceTemplate::new(&reference_text()).unwrap()),
                90.0,
                alerts,
                options.concurrency,
                Some(self.metrics.clone()),
            );
            let cfg = WatcherConfig {
                checkpoint_path: self.checkpoint().path().display().to_string(),
                pipeline_concurrency: options.concurrency,
                pipeline_queue_capacity: options.capacity,
            };
            ChainWatcher::new(
                ContractDetector::new(provider),
                pipeline,
                &cfg,
                Some(self.metrics.clone()),
            )
        }
    }

    async fn run_blocks(watcher: &mut ChainWatcher, events: Vec<FeedEvent>) -> WatcherError {
        let (tx, rx) = tracked_channel(16, None);
        for event in events {
            tx.send(event).await.unwrap();
        }
        drop(tx);
        watcher.run(rx).await.unwrap_err()
    }

    #[tokio::test]
    async fn out_of_order_blocks_only_move_forward() {
        let harness = Harness::new();
        harness.asserter.push_success(&Some(build_block(5, Vec::new())));
        harness.asserter.push_success(&Some(build_block(7, Vec::new())));
        let mut watcher = harness.watcher(
            "http://127.0.0.1:9/api".to_string(),
            AlertDispatcher::new(None, "https://explorer/address/"),
        );

        let err = run_blocks(
            &mut watcher,
            vec![FeedEvent::Block(5), FeedEvent::Block(3), FeedEvent::Block(7)],
        )
        .await;
        assert!(matches!(err, WatcherError::FeedClosed));
        assert_eq!(watcher.last_block(), 7);
        assert_eq!(harness.checkpoint().load(), Checkpoint::new(7));
        assert_eq!(harness.metrics.stale_blocks.get(), 1);
        assert_eq!(harness.metrics.blocks_processed.get(), 2);
        assert!(harness.asserter.read_q().is_empty());
    }

    #[tokio::test]
    async fn restart_resumes_after_checkpoint() {
        let harness = Harness::new();
        harness.checkpoint().save(Checkpoint::new(10)).unwrap();
        harness.asserter.push_success(&Some(build_block(11, Vec::new())));
        let mut watcher = harness.watcher(
            "http://127.0.0.1:9/api".to_string(),
            AlertDispatcher::new(None, "https://explorer/address/"),
        );
        assert_eq!(watcher.last_block(), 10);

        run_blocks(
            &mut watcher,
            vec![FeedEvent::Block(9), FeedEvent::Block(10), FeedEvent::Block(11)],
        )
        .await;
        assert_eq!(harness.checkpoint().load().last_block, 11);
        assert_eq!(harness.metrics.stale_blocks.get(), 2);
        assert!(harness.asserter.read_q().is_empty());
    }

    #[tokio::test]
    async fn failed_block_fetch_keeps_the_checkpoint() {
        let harness = Harness::new();
        harness.asserter.push_failure_msg("header not found");
        let mut watcher = harness.watcher(
            "http://127.0.0.1:9/api".to_string(),
            AlertDispatcher::new(None, "https://explorer/address/"),
        );

        run_blocks(&mut watcher, vec![FeedEvent::Block(42)]).await;
        assert_eq!(harness.checkpoint().load().last_block, 42);
        assert_eq!(harness.metrics.block_failures.get(), 1);
    }

    #[tokio::test]
    async fn fatal_feed_stops_the_watcher() {
        let harness = Harness::new();
        let mut watcher = harness.watcher(
            "http://127.0.0.1:9/api".to_string(),
            AlertDispatcher::new(None, "https://explorer/address/"),
        );
        let err = run_blocks(
            &mut watcher,
            vec![FeedEvent::Fatal(FeedError::conflicting_instance("409 Conflict"))],
        )
        .await;
        match err {
            WatcherError::FeedFatal(cause) => {
                assert_eq!(cause.kind, FeedErrorKind::ConflictingInstance);
            }
            other => panic!("expected fatal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_clone_is_alerted() {
        let harness = Harness::new();
        let create = B256::from([1u8; 32]);
        let call = B256::from([2u8; 32]);
        harness.asserter.push_success(&Some(build_block(
            100,
            vec![
                build_tx(Some(address!("0x2000000000000000000000000000000000000002")), call),
                build_tx(None, create),
            ],
        )));
        harness.asserter.push_success(&Some(build_receipt(create, DEPLOYED)));

        let (explorer_url, explorer) = respond_once(explorer_body(&candidate_text(19))).await;
        let (telegram_url, telegram) = respond_once("{\"ok\":true}".to_string()).await;
        let alerts = AlertDispatcher::new(
            Some(TelegramNotifier::new(&telegram_url, "TOKEN", "42".to_string())),
            "https://base.blockscout.com/address/",
        );
        let mut watcher = harness.watcher(format!("{explorer_url}/api"), alerts);

        run_blocks(&mut watcher, vec![FeedEvent::Block(100)]).await;

        let lookup = explorer.await.unwrap();
        assert!(lookup.contains(&format!("address={DEPLOYED}")));
        let sent = telegram.await.unwrap();
        assert!(sent.starts_with("POST /botTOKEN/sendMessage"));
        assert!(sent.contains(&DEPLOYED.to_string()));
        assert!(sent.contains("Similarity:95.00%"));
        assert_eq!(harness.metrics.deployments_total.get(), 1);
        assert_eq!(
            harness
                .metrics
                .alerts_total
                .with_label_values(&["delivered"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn distant_contract_is_not_alerted() {
        let harness = Harness::new();
        let create = B256::from([1u8; 32]);
        harness
            .asserter
            .push_success(&Some(build_block(100, vec![build_tx(None, create)])));
        harness.asserter.push_success(&Some(build_receipt(create, DEPLOYED)));
        let (explorer_url, explorer) = respond_once(explorer_body(&candidate_text(10))).await;
        let mut watcher = harness.watcher(
            format!("{explorer_url}/api"),
            AlertDispatcher::new(None, "https://explorer/address/"),
        );

        run_blocks(&mut watcher, vec![FeedEvent::Block(100)]).await;
        explorer.await.unwrap();
        assert_eq!(harness.metrics.deployments_total.get(), 1);
        assert_eq!(
            harness
                .metrics
                .alerts_total
                .with_label_values(&["logged"])
                .get(),
            0
        );
    }

    #[tokio::test]
    async fn unverified_source_is_skipped() {
        let harness = Harness::new();
        let create = B256::from([1u8; 32]);
        harness
            .asserter
            .push_success(&Some(build_block(100, vec![build_tx(None, create)])));
        harness.asserter.push_success(&Some(build_receipt(create, DEPLOYED)));
        let (explorer_url, explorer) = respond_once(UNVERIFIED.to_string()).await;
        let mut watcher = harness.watcher(
            format!("{explorer_url}/api"),
            AlertDispatcher::new(None, "https://explorer/address/"),
        );

        run_blocks(&mut watcher, vec![FeedEvent::Block(100)]).await;
        explorer.await.unwrap();
        assert_eq!(harness.metrics.sources_unavailable.get(), 1);
    }

    #[tokio::test]
    async fn threshold_is_inclusive() {
        let harness = Harness::new();
        let create = B256::from([1u8; 32]);
        harness
            .asserter
            .push_success(&Some(build_block(100, vec![build_tx(None, create)])));
        harness.asserter.push_success(&Some(build_receipt(create, DEPLOYED)));
        // 18 of 20 lines is exactly 90%
        let (explorer_url, explorer) = respond_once(explorer_body(&candidate_text(18))).await;
        let mut watcher = harness.watcher(
            format!("{explorer_url}/api"),
            AlertDispatcher::new(None, "https://explorer/address/"),
        );

        run_blocks(&mut watcher, vec![FeedEvent::Block(100)]).await;
        explorer.await.unwrap();
        assert_eq!(
            harness
                .metrics
                .alerts_total
                .with_label_values(&["logged"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn settle_delay_does_not_hold_explorer_slots() {
        let harness = Harness::new();
        let hashes: Vec<B256> = (1..=17u8).map(|i| B256::from([i; 32])).collect();
        harness.asserter.push_success(&Some(build_block(
            100,
            hashes.iter().map(|hash| build_tx(None, *hash)).collect(),
        )));
        for (i, hash) in hashes.iter().enumerate() {
            harness
                .asserter
                .push_success(&Some(build_receipt(*hash, Address::with_last_byte(i as u8 + 1))));
        }
        let (explorer_url, explorer) = serve_many(17, UNVERIFIED.to_string()).await;
        let mut watcher = harness.watcher_with(
            harness.mocked(),
            format!("{explorer_url}/api"),
            logged_alerts(),
            Options {
                settle_delay_ms: 1_000,
                concurrency: 16,
                capacity: 32,
            },
        );

        run_blocks(&mut watcher, vec![FeedEvent::Block(100)]).await;
        let arrivals = explorer.await.unwrap();
        assert_eq!(arrivals.len(), 17);
        // all lookups follow one shared settle window, not two back to back
        for arrival in arrivals {
            assert!(arrival >= Duration::from_millis(1_000), "{arrival:?}");
            assert!(arrival < Duration::from_millis(1_900), "{arrival:?}");
        }
        assert_eq!(harness.metrics.deployments_total.get(), 17);
        assert_eq!(harness.metrics.sources_unavailable.get(), 17);
        assert_eq!(harness.metrics.pipeline_dropped.get(), 0);
    }

    #[tokio::test]
    async fn next_block_is_scanned_during_settle_delay() {
        let harness = Harness::new();
        let first = B256::from([1u8; 32]);
        let second = B256::from([2u8; 32]);
        harness
            .asserter
            .push_success(&Some(build_block(100, vec![build_tx(None, first)])));
        harness
            .asserter
            .push_success(&Some(build_receipt(first, Address::with_last_byte(1))));
        harness
            .asserter
            .push_success(&Some(build_block(101, vec![build_tx(None, second)])));
        harness
            .asserter
            .push_success(&Some(build_receipt(second, Address::with_last_byte(2))));
        let (explorer_url, explorer) = serve_many(2, UNVERIFIED.to_string()).await;
        let mut watcher = harness.watcher_with(
            harness.mocked(),
            format!("{explorer_url}/api"),
            logged_alerts(),
            Options {
                settle_delay_ms: 1_000,
                concurrency: 1,
                capacity: 16,
            },
        );

        run_blocks(&mut watcher, vec![FeedEvent::Block(100), FeedEvent::Block(101)]).await;
        let arrivals = explorer.await.unwrap();
        for arrival in arrivals {
            assert!(arrival >= Duration::from_millis(1_000), "{arrival:?}");
            assert!(arrival < Duration::from_millis(1_900), "{arrival:?}");
        }
        assert_eq!(harness.checkpoint().load().last_block, 101);
        assert_eq!(harness.metrics.blocks_processed.get(), 2);
        assert_eq!(harness.metrics.sources_unavailable.get(), 2);
        assert!(harness.asserter.read_q().is_empty());
    }

    #[tokio::test]
    async fn full_block_queue_counts_dropped_blocks() {
        let harness = Harness::new();
        // accepts connections but never answers, so the first scan hangs
        let rpc = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rpc_url = format!("http://{}", rpc.local_addr().unwrap());
        let provider = ProviderBuilder::new()
            .connect_http(rpc_url.parse().unwrap())
            .erased();
        let mut watcher = harness.watcher_with(
            provider,
            "http://127.0.0.1:9/api".to_string(),
            logged_alerts(),
            Options {
                settle_delay_ms: 0,
                concurrency: 1,
                capacity: 0,
            },
        );

        let (tx, rx) = tracked_channel(16, None);
        tx.send(FeedEvent::Block(1)).await.unwrap();
        tx.send(FeedEvent::Block(2)).await.unwrap();
        let result = timeout(Duration::from_millis(500), watcher.run(rx)).await;
        assert!(result.is_err(), "watcher should still be waiting on block 1");

        assert_eq!(watcher.last_block(), 2);
        assert_eq!(harness.metrics.blocks_processed.get(), 2);
        assert_eq!(harness.metrics.blocks_dropped.get(), 1);
        assert_eq!(harness.checkpoint().load().last_block, 2);
        drop(tx);
    }

    #[tokio::test]
    async fn checkpoint_settles_on_latest_block() {
        let harness = Harness::new();
        for number in 1..=12 {
            harness
                .asserter
                .push_success(&Some(build_block(number, Vec::new())));
        }
        let mut watcher = harness.watcher(
            "http://127.0.0.1:9/api".to_string(),
            logged_alerts(),
        );

        let events = (1..=12).map(FeedEvent::Block).collect();
        let err = run_blocks(&mut watcher, events).await;
        assert!(matches!(err, WatcherError::FeedClosed));
        assert_eq!(harness.checkpoint().load(), Checkpoint::new(12));
        assert_eq!(harness.metrics.blocks_processed.get(), 12);
    }
}
