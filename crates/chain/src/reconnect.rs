use alloy::transports::{RpcError, TransportErrorKind};
use clonewatch_core::config::FeedConfig;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

const CONFLICT_MARKERS: [&str; 3] = ["409 conflict", "conflict: terminated by other", "another instance"];

#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub fatal_retry_delay: Duration,
}

impl ReconnectConfig {
    pub fn new(base_ms: u64, max_ms: u64, fatal_retry_ms: u64) -> Self {
        Self {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            fatal_retry_delay: Duration::from_millis(fatal_retry_ms),
        }
    }

    pub fn from_config(cfg: &FeedConfig) -> Self {
        Self::new(cfg.reconnect_base_ms, cfg.reconnect_max_ms, cfg.fatal_retry_delay_ms)
    }
}

pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next_ms = current.as_millis().saturating_mul(2) as u64;
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(next_ms.min(max_ms))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedErrorKind {
    Transient,
    FatalTransport,
    /// Another process already owns the subscription.
    ConflictingInstance,
}

impl FeedErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::FatalTransport => "fatal_transport",
            Self::ConflictingInstance => "conflicting_instance",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{} feed error: {message}", kind.as_str())]
pub struct FeedError {
    pub kind: FeedErrorKind,
    pub message: String,
}

impl FeedError {
    pub fn new(kind: FeedErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FeedErrorKind::Transient, message)
    }

    pub fn fatal_transport(message: impl Into<String>) -> Self {
        Self::new(FeedErrorKind::FatalTransport, message)
    }

    pub fn conflicting_instance(message: impl Into<String>) -> Self {
        Self::new(FeedErrorKind::ConflictingInstance, message)
    }

    pub fn from_rpc(err: &RpcError<TransportErrorKind>) -> Self {
        let message = err.to_string();
        if is_conflict(&message) {
            return Self::conflicting_instance(message);
        }
        match err {
            RpcError::Transport(TransportErrorKind::HttpError(http)) if http.status == 409 => {
                Self::conflicting_instance(message)
            }
            RpcError::Transport(
                TransportErrorKind::BackendGone | TransportErrorKind::PubsubUnavailable,
            ) => Self::fatal_transport(message),
            _ => Self::transient(message),
        }
    }
}

fn is_conflict(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    CONFLICT_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// A subscription the supervisor can tear down and bring back.
pub trait Feed {
    fn stop(&mut self) -> impl Future<Output = Result<(), FeedError>> + Send;
    fn resume(&mut self) -> impl Future<Output = Result<(), FeedError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Connected,
    ReconnectingFixedDelay,
    ReconnectingBackoff,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub state: ReconnectState,
    pub waited: Duration,
    /// Why the resumption failed, when it did.
    pub resume_error: Option<FeedError>,
}

impl Transition {
    fn settled(state: ReconnectState, waited: Duration) -> Self {
        Self {
            state,
            waited,
            resume_error: None,
        }
    }
}

pub struct ReconnectSupervisor {
    cfg: ReconnectConfig,
    state: ReconnectState,
    current_delay: Duration,
}

impl ReconnectSupervisor {
    pub fn new(cfg: ReconnectConfig) -> Self {
        Self {
            cfg,
            state: ReconnectState::Connected,
            current_delay: cfg.base_delay,
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Stops `feed`, then waits and resumes according to the error's kind.
    /// A failed backoff resumption leaves the supervisor in
    /// `ReconnectingBackoff`; the caller feeds the returned `resume_error`
    /// back in as the next error.
    pub async fn handle_error<F: Feed>(&mut self, feed: &mut F, err: &FeedError) -> Transition {
        if self.state == ReconnectState::Fatal {
            return Transition::settled(ReconnectState::Fatal, Duration::ZERO);
        }

        if let Err(stop_err) = feed.stop().await {
            warn!(error = %stop_err, "failed to stop feed subscription");
        }

        match err.kind {
            FeedErrorKind::ConflictingInstance => {
                error!(error = %err, "another instance owns the feed subscription");
                self.state = ReconnectState::Fatal;
                Transition::settled(ReconnectState::Fatal, Duration::ZERO)
            }
            FeedErrorKind::FatalTransport => {
                self.state = ReconnectState::ReconnectingFixedDelay;
                let wait = self.cfg.fatal_retry_delay;
                warn!(wait_ms = wait.as_millis() as u64, "fatal feed transport error; attempting reconnect");
                sleep(wait).await;
                match feed.resume().await {
                    Ok(()) => {
                        self.mark_connected();
                        Transition::settled(ReconnectState::Connected, wait)
                    }
                    Err(resume_err) => {
                        error!(error = %resume_err, "feed reconnect after fatal transport error failed");
                        self.state = ReconnectState::Fatal;
                        Transition {
                            state: ReconnectState::Fatal,
                            waited: wait,
                            resume_error: Some(resume_err),
                        }
                    }
                }
            }
            FeedErrorKind::Transient => {
                self.state = ReconnectState::ReconnectingBackoff;
                let wait = self.current_delay;
                info!(wait_ms = wait.as_millis() as u64, "reconnecting feed");
                sleep(wait).await;
                match feed.resume().await {
                    Ok(()) => {
                        self.mark_connected();
                        Transition::settled(ReconnectState::Connected, wait)
                    }
                    Err(resume_err) => {
                        warn!(error = %resume_err, "feed reconnect failed");
                        self.current_delay = next_backoff(self.current_delay, self.cfg.max_delay);
                        Transition {
                            state: ReconnectState::ReconnectingBackoff,
                            waited: wait,
                            resume_error: Some(resume_err),
                        }
                    }
                }
            }
        }
    }

    fn mark_connected(&mut self) {
        info!("feed subscription restarted");
        self.state = ReconnectState::Connected;
        self.current_delay = self.cfg.base_delay;
    }
}
