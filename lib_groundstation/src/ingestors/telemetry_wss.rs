//! # Telemetry WebSocket Ingestor
//!
//! Owns one WebSocket connection to a telemetry source, turns every inbound
//! frame into a [`TelemetryDatum`] and overwrites the latest-value cache with
//! it. Delivery to subscribers happens elsewhere, on the multiplexer's timer,
//! which runs under a child of this adapter's shutdown token so closing the
//! connection stops distribution too.
//!
//! ## Connection lifecycle
//!
//! `Disconnected -> Connecting -> Connected -> {Error, Closed} -> Disconnected`
//!
//! Failed connects and dropped connections are retried with exponential
//! backoff: the delay starts at `reconnect_base_delay`, doubles on every
//! failure up to `reconnect_max_delay`, and resets after a successful connect.
//! `close()` is terminal and leaves the adapter in `Closed`.
//!
//! ## Wire format
//!
//! One JSON object per frame:
//!
//! ```json
//! { "timestamp": 1718000000000, "data": { "latitude": 52.1, "longitude": 4.3 } }
//! ```
//!
//! Values may also sit flat beside `timestamp`. An optional
//! `"identifier": {"namespace": .., "key": ..}` routes the sample to another
//! object than the configured default. A frame without a numeric `timestamp`
//! is rejected and counted; it never ends the connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{Stream, StreamExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, protocol::Message as WsMessage};
use tokio_util::sync::CancellationToken;

use crate::core::multiplexer::{DeliveryMode, LatestValueCache, SubscriptionMultiplexer};
use crate::core::types::{Identifier, Scalar, TelemetryDatum, TIMESTAMP_KEY};

/// Endpoint of the original ground-station relay.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080";
/// Namespace of the balloon telemetry objects.
pub const DEFAULT_NAMESPACE: &str = "example.telemetry";
/// Key of the single live telemetry point.
pub const DEFAULT_KEY: &str = "websocket.telemetry";

const IDENTIFIER_FIELD: &str = "identifier";
const DATA_FIELD: &str = "data";

/// Settings of one ingestion connection.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub url: String,
    /// Target of messages that carry no `identifier`.
    pub default_identifier: Identifier,
    pub distribution_period: Duration,
    pub delivery_mode: DeliveryMode,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Consecutive failed connects tolerated before giving up. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Silence after which a connected stream is considered dead.
    pub inactivity_timeout: Option<Duration>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            default_identifier: Identifier::new(DEFAULT_NAMESPACE, DEFAULT_KEY),
            distribution_period: Duration::from_secs(1),
            delivery_mode: DeliveryMode::EveryTick,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            max_reconnect_attempts: None,
            inactivity_timeout: None,
        }
    }
}

/// A single inbound message that could not be turned into a datum.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("message is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no timestamp")]
    MissingTimestamp,
    #[error("timestamp is not a finite number: {0}")]
    InvalidTimestamp(Value),
    #[error("identifier is malformed: {0}")]
    InvalidIdentifier(String),
    #[error("'data' must be an object, got {0}")]
    InvalidData(Value),
    #[error("binary frame is not UTF-8")]
    NotUtf8,
}

/// Transport failures. They drive the state machine and never reach subscribers.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("stream read failed: {0}")]
    Read(#[source] tungstenite::Error),
    #[error("no frame received for {0:?}")]
    InactivityTimeout(Duration),
    #[error("gave up after {attempts} failed connection attempt(s)")]
    RetriesExhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Closed,
}

/// Message counters since the adapter was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: u64,
    pub rejected: u64,
}

/// Handles of the tasks started by [`IngestionAdapter::spawn`].
pub struct IngestionTasks {
    pub ingest: JoinHandle<Result<(), ConnectionError>>,
    pub distribution: JoinHandle<()>,
}

/// Parses one wire message.
pub fn parse_message(text: &str, default_identifier: &Identifier) -> Result<TelemetryDatum, IngestError> {
    let Value::Object(mut fields) = serde_json::from_str::<Value>(text)? else {
        return Err(IngestError::NotAnObject);
    };

    let timestamp = match fields.remove(TIMESTAMP_KEY) {
        None => return Err(IngestError::MissingTimestamp),
        Some(value) => parse_timestamp(value)?,
    };

    let identifier = match fields.remove(IDENTIFIER_FIELD) {
        None => default_identifier.clone(),
        Some(value) => serde_json::from_value::<Identifier>(value)
            .map_err(|e| IngestError::InvalidIdentifier(e.to_string()))?,
    };

    let nested = match fields.remove(DATA_FIELD) {
        None => Map::new(),
        Some(Value::Object(map)) => map,
        Some(other) => return Err(IngestError::InvalidData(other)),
    };

    let mut datum = TelemetryDatum::new(identifier, timestamp);
    // Flat fields first so nested `data` wins on a clash.
    for (key, value) in fields.into_iter().chain(nested) {
        if key == TIMESTAMP_KEY {
            continue;
        }
        match Scalar::from_json(&value) {
            Some(scalar) => datum.insert(&key, scalar),
            None => tracing::trace!("Skipping non-scalar value '{}'", key),
        }
    }
    Ok(datum)
}

fn parse_timestamp(value: Value) -> Result<i64, IngestError> {
    let parsed = match &value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        _ => None,
    };
    parsed.ok_or(IngestError::InvalidTimestamp(value))
}

/// # Ingestion Adapter
///
/// One connection, one cache, one multiplexer.
pub struct IngestionAdapter {
    config: IngestConfig,
    cache: Arc<LatestValueCache>,
    multiplexer: Arc<SubscriptionMultiplexer>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl IngestionAdapter {
    pub fn new(config: IngestConfig) -> Self {
        let cache = Arc::new(LatestValueCache::new());
        let multiplexer = Arc::new(
            SubscriptionMultiplexer::new(Arc::clone(&cache), config.distribution_period)
                .with_delivery_mode(config.delivery_mode),
        );
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            config,
            cache,
            multiplexer,
            state,
            shutdown: CancellationToken::new(),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<LatestValueCache> {
        &self.cache
    }

    pub fn multiplexer(&self) -> &Arc<SubscriptionMultiplexer> {
        &self.multiplexer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn parse_message(&self, text: &str) -> Result<TelemetryDatum, IngestError> {
        parse_message(text, &self.config.default_identifier)
    }

    /// Handles one text frame. Rejections are logged and counted, never
    /// propagated. Returns the cache revision of an accepted sample.
    pub fn ingest(&self, text: &str) -> Option<u64> {
        match self.parse_message(text) {
            Ok(datum) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                Some(self.cache.put(datum))
            }
            Err(e) => {
                self.reject(&e);
                None
            }
        }
    }

    /// Handles one binary frame carrying UTF-8 JSON.
    pub fn ingest_bytes(&self, bytes: &[u8]) -> Option<u64> {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.ingest(text),
            Err(_) => {
                self.reject(&IngestError::NotUtf8);
                None
            }
        }
    }

    fn reject(&self, error: &IngestError) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Discarding malformed telemetry message: {}", error);
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!("Connection state {:?} -> {:?}", previous, next);
        }
    }

    /// # Run
    ///
    /// Connects and ingests until [`close`](Self::close) is called. Returns
    /// `Ok(())` on close, or `RetriesExhausted` once the configured number of
    /// consecutive connects has failed.
    pub async fn run(&self) -> Result<(), ConnectionError> {
        let mut backoff = self.config.reconnect_base_delay;
        let mut failed_attempts: u32 = 0;

        while !self.shutdown.is_cancelled() {
            self.set_state(ConnectionState::Connecting);
            tracing::info!("Connecting to telemetry source: {}", self.config.url);

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = connect_async(self.config.url.as_str()) => result,
            };

            match connected {
                Ok((ws_stream, _)) => {
                    tracing::info!("Connected to {}", self.config.url);
                    self.set_state(ConnectionState::Connected);
                    backoff = self.config.reconnect_base_delay;
                    failed_attempts = 0;

                    match self.pump(ws_stream).await {
                        Ok(()) => self.set_state(ConnectionState::Closed),
                        Err(e) => {
                            tracing::warn!("Telemetry stream lost: {}", e);
                            self.set_state(ConnectionState::Error);
                        }
                    }
                }
                Err(source) => {
                    let error = ConnectionError::Connect {
                        url: self.config.url.clone(),
                        source,
                    };
                    self.set_state(ConnectionState::Error);
                    failed_attempts += 1;

                    if let Some(max) = self.config.max_reconnect_attempts {
                        if failed_attempts >= max {
                            tracing::error!("{}. Giving up after {} attempt(s).", error, failed_attempts);
                            self.close();
                            return Err(ConnectionError::RetriesExhausted {
                                attempts: failed_attempts,
                            });
                        }
                    }
                    tracing::error!("{}. Retrying in {:?}...", error, backoff);
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Disconnected);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(backoff) => {}
            }
            backoff = std::cmp::min(backoff * 2, self.config.reconnect_max_delay);
        }

        self.set_state(ConnectionState::Closed);
        tracing::info!("Telemetry ingestion for {} closed.", self.config.url);
        Ok(())
    }

    /// Reads frames until the peer closes, the stream fails, the watchdog
    /// fires or the adapter is closed.
    pub async fn pump<S>(&self, mut stream: S) -> Result<(), ConnectionError>
    where
        S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                frame = next_frame(&mut stream, self.config.inactivity_timeout) => frame,
            };

            match frame {
                Err(silence) => {
                    tracing::warn!("Watchdog triggered: no data for {:?}. Reconnecting...", silence);
                    return Err(ConnectionError::InactivityTimeout(silence));
                }
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    self.ingest(text.as_str());
                }
                Ok(Some(Ok(WsMessage::Binary(bytes)))) => {
                    self.ingest_bytes(&bytes);
                }
                Ok(Some(Ok(WsMessage::Close(frame)))) => {
                    tracing::info!("Telemetry source closed the stream: {:?}", frame);
                    return Ok(());
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => return Err(ConnectionError::Read(e)),
                Ok(None) => {
                    tracing::warn!("Telemetry stream ended by remote host.");
                    return Ok(());
                }
            }
        }
    }

    /// Stops ingestion and the distribution timer. Idempotent.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("Closing telemetry ingestion for {}", self.config.url);
        }
        self.shutdown.cancel();
        self.set_state(ConnectionState::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Starts the connection loop and the distribution timer.
    pub fn spawn(self: &Arc<Self>) -> IngestionTasks {
        let distribution = self.multiplexer.spawn_distribution(self.shutdown.child_token());
        let adapter = Arc::clone(self);
        let ingest = tokio::spawn(async move { adapter.run().await });
        IngestionTasks { ingest, distribution }
    }
}

/// Next frame, or the configured silence if the watchdog fires first.
async fn next_frame<S>(
    stream: &mut S,
    inactivity: Option<Duration>,
) -> Result<Option<Result<WsMessage, tungstenite::Error>>, Duration>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    match inactivity {
        Some(limit) => timeout(limit, stream.next()).await.map_err(|_| limit),
        None => Ok(stream.next().await),
    }
}
