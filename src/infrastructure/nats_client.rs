// Copyright 2025 Cowboy AI, LLC.

//! NATS JetStream transport
//!
//! Maps the broker model onto JetStream:
//! - an exchange is a file-backed stream capturing `<exchange>.>`
//! - a routing key is the subject suffix, so `OrderPlaced` is published on
//!   `<exchange>.OrderPlaced`
//! - a queue is a durable pull consumer whose filter subjects are its bindings
//!
//! A consumer cannot have an empty filter list without receiving everything,
//! so a queue with no bindings filters on a placeholder subject no publisher
//! uses. JetStream stores every message captured by the stream, so a
//! mandatory publish is never reported as returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::connection::State;
use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::stream::{self, StorageType};
use async_nats::jetstream::{self, Context as JetStreamContext};
use async_nats::{Client, ConnectErrorKind, ConnectOptions, Event, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, ConnectionSignal, Delivery, DeliveryAcker,
    DeliveryStream, OutgoingMessage, PublishOutcome, TransportError,
};

/// Errors that can occur when configuring NATS
#[derive(Debug, Error)]
pub enum NatsError {
    /// Failed to establish connection to NATS server
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Error occurred in JetStream operations
    #[error("JetStream error: {0}")]
    JetStreamError(String),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Authentication credentials were rejected
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
}

impl From<NatsError> for TransportError {
    fn from(err: NatsError) -> Self {
        match err {
            NatsError::ConnectionFailed(reason) => TransportError::Unreachable(reason),
            NatsError::AuthenticationFailed(reason) => TransportError::AccessRefused(reason),
            NatsError::JetStreamError(reason) | NatsError::ConfigurationError(reason) => {
                TransportError::Protocol(reason)
            }
        }
    }
}

/// Configuration for NATS client connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URL (e.g., "nats://localhost:4222")
    pub url: String,

    /// Optional username for authentication
    pub user: Option<String>,

    /// Optional password for authentication
    pub password: Option<String>,

    /// Whether TLS is required
    pub tls_required: bool,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,

    /// Reconnect interval in seconds
    pub reconnect_interval_secs: u64,

    /// Maximum reconnect attempts (0 = infinite)
    pub max_reconnects: usize,

    /// JetStream domain (optional)
    pub jetstream_domain: Option<String>,

    /// JetStream API prefix (optional)
    pub jetstream_prefix: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            user: None,
            password: None,
            tls_required: false,
            connection_timeout_secs: 10,
            reconnect_interval_secs: 5,
            max_reconnects: 0,
            jetstream_domain: None,
            jetstream_prefix: None,
        }
    }
}

impl NatsConfig {
    fn validate(&self) -> Result<(), NatsError> {
        if self.url.trim().is_empty() {
            return Err(NatsError::ConfigurationError("url is empty".to_string()));
        }
        if self.user.is_some() != self.password.is_some() {
            return Err(NatsError::ConfigurationError(
                "user and password must be set together".to_string(),
            ));
        }
        if self.jetstream_domain.is_some() && self.jetstream_prefix.is_some() {
            return Err(NatsError::ConfigurationError(
                "jetstream_domain and jetstream_prefix are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

/// `0` means reconnect forever
fn reconnect_limit(max_reconnects: usize) -> Option<usize> {
    (max_reconnects > 0).then_some(max_reconnects)
}

fn subject_for(exchange: &str, routing_key: &str) -> String {
    format!("{exchange}.{routing_key}")
}

fn unbound_subject(exchange: &str, queue: &str) -> String {
    format!("{exchange}._unbound.{queue}")
}

fn jetstream_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Protocol(err.to_string())
}

/// Opens JetStream-backed broker connections
#[derive(Debug, Clone)]
pub struct NatsConnector {
    config: NatsConfig,
}

impl NatsConnector {
    /// Create a connector after validating the configuration
    pub fn new(config: NatsConfig) -> Result<Self, NatsError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

#[async_trait]
impl BrokerConnector for NatsConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let config = &self.config;
        let (signals, _) = broadcast::channel(16);
        let event_signals = signals.clone();
        let reconnect_interval = config.reconnect_interval_secs;
        let max_reconnects = config.max_reconnects;

        let mut options = ConnectOptions::new()
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .max_reconnects(reconnect_limit(max_reconnects))
            .reconnect_delay_callback(move |_attempts| Duration::from_secs(reconnect_interval))
            .event_callback(move |event| {
                let signals = event_signals.clone();
                async move {
                    let signal = match event {
                        Event::Disconnected => Some(ConnectionSignal::Shutdown),
                        Event::ClientError(err) => {
                            warn!(error = %err, "NATS client error");
                            Some(ConnectionSignal::CallbackException)
                        }
                        Event::SlowConsumer(sid) => {
                            warn!(sid, "NATS slow consumer");
                            Some(ConnectionSignal::Blocked)
                        }
                        Event::LameDuckMode => Some(ConnectionSignal::Blocked),
                        Event::Connected => {
                            info!("NATS connected");
                            None
                        }
                        other => {
                            debug!(event = ?other, "NATS event");
                            None
                        }
                    };
                    if let Some(signal) = signal {
                        let _ = signals.send(signal);
                    }
                }
            });

        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            options = options.user_and_password(user.clone(), password.clone());
        }

        if config.tls_required {
            options = options.require_tls(true);
        }

        let client = options.connect(&config.url).await.map_err(|e| {
            let reason = format!("Failed to connect to {}: {}", config.url, e);
            match e.kind() {
                ConnectErrorKind::Authentication | ConnectErrorKind::AuthorizationViolation => {
                    TransportError::from(NatsError::AuthenticationFailed(reason))
                }
                _ => TransportError::from(NatsError::ConnectionFailed(reason)),
            }
        })?;

        let context = match (&config.jetstream_domain, &config.jetstream_prefix) {
            (Some(domain), _) => jetstream::with_domain(client.clone(), domain),
            (None, Some(prefix)) => jetstream::with_prefix(client.clone(), prefix),
            (None, None) => jetstream::new(client.clone()),
        };

        Ok(Arc::new(NatsConnection {
            client,
            context,
            signals,
            closed: AtomicBool::new(false),
            drain_timeout: Duration::from_secs(config.connection_timeout_secs),
        }))
    }
}

/// Connection to a NATS server with JetStream enabled
pub struct NatsConnection {
    client: Client,
    context: JetStreamContext,
    signals: broadcast::Sender<ConnectionSignal>,
    closed: AtomicBool,
    drain_timeout: Duration,
}

impl NatsConnection {
    /// Get the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl BrokerConnection for NatsConnection {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && matches!(self.client.connection_state(), State::Connected)
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(Box::new(NatsChannel {
            context: self.context.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn signals(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.signals.subscribe()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Drain flushes pending publishes and stops the client's reconnect loop.
        match tokio::time::timeout(self.drain_timeout, self.client.drain()).await {
            Ok(result) => result.map_err(|e| TransportError::Io(e.to_string())),
            Err(_) => Err(TransportError::Io(format!(
                "drain did not finish within {}s",
                self.drain_timeout.as_secs()
            ))),
        }
    }
}

struct NatsChannel {
    context: JetStreamContext,
    closed: AtomicBool,
}

impl NatsChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    async fn stream(&self, exchange: &str) -> Result<stream::Stream, TransportError> {
        self.context
            .get_stream(exchange)
            .await
            .map_err(jetstream_error)
    }

    async fn filters(&self, exchange: &str, queue: &str) -> Result<Vec<String>, TransportError> {
        let stream = self.stream(exchange).await?;
        let mut consumer: jetstream::consumer::Consumer<pull::Config> =
            stream.get_consumer(queue).await.map_err(jetstream_error)?;
        let info = consumer.info().await.map_err(jetstream_error)?;
        let config = &info.config;
        let mut filters = config.filter_subjects.clone();
        if !config.filter_subject.is_empty() {
            filters.push(config.filter_subject.clone());
        }
        Ok(filters)
    }

    async fn update_filters(
        &self,
        exchange: &str,
        queue: &str,
        mut filters: Vec<String>,
    ) -> Result<(), TransportError> {
        if filters.is_empty() {
            filters.push(unbound_subject(exchange, queue));
        }
        let stream = self.stream(exchange).await?;
        stream
            .create_consumer(consumer_config(queue, filters))
            .await
            .map_err(jetstream_error)?;
        Ok(())
    }
}

fn consumer_config(queue: &str, filter_subjects: Vec<String>) -> pull::Config {
    pull::Config {
        durable_name: Some(queue.to_string()),
        filter_subjects,
        ack_policy: AckPolicy::Explicit,
        deliver_policy: DeliverPolicy::New,
        ..Default::default()
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl DeliveryAcker for NatsAcker {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.message
            .ack()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

#[async_trait]
impl BrokerChannel for NatsChannel {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.context
            .get_or_create_stream(stream::Config {
                name: exchange.to_string(),
                subjects: vec![format!("{exchange}.>")],
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(jetstream_error)?;
        debug!(exchange, "Stream declared");
        Ok(())
    }

    async fn declare_queue(&self, exchange: &str, queue: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let stream = self.stream(exchange).await?;
        stream
            .get_or_create_consumer(
                queue,
                consumer_config(queue, vec![unbound_subject(exchange, queue)]),
            )
            .await
            .map_err(jetstream_error)?;
        debug!(exchange, queue, "Durable consumer declared");
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let subject = subject_for(exchange, routing_key);
        let placeholder = unbound_subject(exchange, queue);
        let mut filters: Vec<String> = self
            .filters(exchange, queue)
            .await?
            .into_iter()
            .filter(|f| *f != placeholder)
            .collect();
        if filters.contains(&subject) {
            return Ok(());
        }
        filters.push(subject);
        self.update_filters(exchange, queue, filters).await
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let subject = subject_for(exchange, routing_key);
        let filters = self.filters(exchange, queue).await?;
        if !filters.contains(&subject) {
            return Ok(());
        }
        let remaining = filters.into_iter().filter(|f| *f != subject).collect();
        self.update_filters(exchange, queue, remaining).await
    }

    async fn publish(&self, message: OutgoingMessage) -> Result<PublishOutcome, TransportError> {
        self.ensure_open()?;
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "application/json");

        let subject = subject_for(&message.exchange, &message.routing_key);
        let ack = self
            .context
            .publish_with_headers(subject, headers, message.body)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        ack.await.map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(PublishOutcome::Routed)
    }

    async fn consume(&self, exchange: &str, queue: &str) -> Result<DeliveryStream, TransportError> {
        self.ensure_open()?;
        let stream = self.stream(exchange).await?;
        let consumer: jetstream::consumer::Consumer<pull::Config> =
            stream.get_consumer(queue).await.map_err(jetstream_error)?;
        let messages = consumer.messages().await.map_err(jetstream_error)?;
        let prefix = format!("{exchange}.");

        Ok(Box::pin(messages.map(move |item| -> Result<Delivery, TransportError> {
            let message = item.map_err(|e| TransportError::Io(e.to_string()))?;
            let subject: &str = &message.subject;
            let routing_key = subject
                .strip_prefix(prefix.as_str())
                .unwrap_or(subject)
                .to_string();
            let body = message.payload.clone();
            Ok(Delivery::new(routing_key, body, Box::new(NatsAcker { message })))
        })))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
