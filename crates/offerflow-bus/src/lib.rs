//! Message-bus transport for OfferFlow.
//!
//! Each durable queue is a JetStream stream whose only subject is the queue
//! name, stored on disk with work-queue retention. Publishing awaits the
//! broker acknowledgement; consuming uses a durable pull consumer with
//! explicit acks and hands every delivery to a local staging queue.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use futures::StreamExt;
use offerflow_core::{
    env_parse_or, env_required, process_env, BackoffPolicy, ConfigError, EnvLookup, StagingSender,
};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "offerflow-bus";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus transport is not connected")]
    NotConnected,
    #[error("connecting to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },
    #[error("declaring queue {queue} failed: {reason}")]
    Declare { queue: String, reason: String },
    #[error("publishing to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },
    #[error("consuming from {queue} failed: {reason}")]
    Consume { queue: String, reason: String },
}

#[derive(Clone)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub connection_timeout: Duration,
    pub connect_backoff: BackoffPolicy,
    pub fetch_batch: usize,
    pub fetch_wait: Duration,
}

impl fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("connection_timeout", &self.connection_timeout)
            .finish_non_exhaustive()
    }
}

impl BusConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    /// Broker settings keep the `RABBITMQ_*` names used by existing deployments.
    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let host = env_required(lookup, "RABBITMQ_HOST")?;
        let raw_port = env_required(lookup, "RABBITMQ_PORT")?;
        let port = parse_port(&raw_port)?;
        let username = env_required(lookup, "RABBITMQ_USERNAME")?;
        let password = env_required(lookup, "RABBITMQ_PASSWORD")?;
        let timeout_secs: u64 = env_parse_or(lookup, "BUS_CONNECTION_TIMEOUT_SECS", 30)?;

        Ok(Self {
            host,
            port,
            username,
            password,
            connection_timeout: Duration::from_secs(timeout_secs),
            connect_backoff: BackoffPolicy {
                max_retries: 5,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
            },
            fetch_batch: 10,
            fetch_wait: Duration::from_secs(5),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }
}

fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    let value: i64 = raw
        .parse()
        .map_err(|_| ConfigError::invalid("RABBITMQ_PORT", format!("{raw:?} is not a number")))?;
    if !(1..=65535).contains(&value) {
        return Err(ConfigError::invalid(
            "RABBITMQ_PORT",
            format!("{value} is outside 1..=65535"),
        ));
    }
    Ok(value as u16)
}

/// Broker seam shared by the transport and the in-memory bus.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Hand every delivery of `queue` to `sink` until `token` is cancelled
    /// or the staging queue closes.
    async fn consume_into(
        &self,
        queue: &str,
        consumer_name: &str,
        sink: StagingSender<Vec<u8>>,
        token: CancellationToken,
    ) -> Result<(), BusError>;
}

/// Publisher and consumer bound to one named queue.
#[derive(Clone)]
pub struct QueueHandle {
    name: String,
    broker: Arc<dyn Broker>,
}

impl fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle").field("name", &self.name).finish()
    }
}

impl QueueHandle {
    pub fn new(name: impl Into<String>, broker: Arc<dyn Broker>) -> Self {
        Self {
            name: name.into(),
            broker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), BusError> {
        self.broker.publish(&self.name, payload.into()).await
    }

    pub async fn consume_into(
        &self,
        consumer_name: &str,
        sink: StagingSender<Vec<u8>>,
        token: CancellationToken,
    ) -> Result<(), BusError> {
        self.broker
            .consume_into(&self.name, consumer_name, sink, token)
            .await
    }
}

#[derive(Clone)]
struct Session {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

/// Owner of the single broker connection of a process.
pub struct BusTransport {
    config: BusConfig,
    session: Mutex<Option<Session>>,
}

impl fmt::Debug for BusTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusTransport")
            .field("addr", &self.config.server_addr())
            .finish_non_exhaustive()
    }
}

impl BusTransport {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    /// Connect once; later calls are no-ops while a session exists.
    pub async fn connect(&self) -> Result<(), BusError> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let addr = self.config.server_addr();
        let backoff = self.config.connect_backoff;
        let mut attempt = 0usize;
        let client = loop {
            info!(
                addr = %addr,
                attempt,
                timeout_secs = self.config.connection_timeout.as_secs(),
                "connecting to message bus"
            );
            match self.connect_options().connect(addr.as_str()).await {
                Ok(client) => break client,
                Err(err) if attempt < backoff.max_retries => {
                    let delay = backoff.delay_for_attempt(attempt);
                    warn!(
                        addr = %addr,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "message bus connection failed"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(BusError::Connect {
                        addr,
                        reason: err.to_string(),
                    })
                }
            }
        };

        let jetstream = jetstream::new(client.clone());
        *guard = Some(Session { client, jetstream });
        info!(addr = %addr, "connected to message bus");
        Ok(())
    }

    fn connect_options(&self) -> async_nats::ConnectOptions {
        async_nats::ConnectOptions::with_user_and_password(
            self.config.username.clone(),
            self.config.password.clone(),
        )
        .name("offerflow")
        .connection_timeout(self.config.connection_timeout)
        .event_callback(|event| async move {
            match event {
                async_nats::Event::Disconnected => {
                    warn!("message bus connection lost; reconnecting")
                }
                async_nats::Event::Connected => info!("message bus connection established"),
                other => debug!(event = %other, "message bus event"),
            }
        })
    }

    /// Current session, provided the connection is open right now.
    async fn open_session(&self) -> Result<Session, BusError> {
        let guard = self.session.lock().await;
        match guard.as_ref() {
            Some(session) if session_is_open(session) => Ok(session.clone()),
            _ => Err(BusError::NotConnected),
        }
    }

    /// Declare a durable queue; declaring an existing queue is a no-op.
    pub async fn declare_queue(&self, name: &str) -> Result<(), BusError> {
        let session = self.open_session().await?;
        session
            .jetstream
            .get_or_create_stream(stream::Config {
                name: name.to_string(),
                subjects: vec![name.to_string()],
                retention: stream::RetentionPolicy::WorkQueue,
                storage: stream::StorageType::File,
                description: Some(format!("OfferFlow durable queue {name}")),
                ..Default::default()
            })
            .await
            .map_err(|err| BusError::Declare {
                queue: name.to_string(),
                reason: err.to_string(),
            })?;
        debug!(queue = name, "queue declared");
        Ok(())
    }

    /// Declare `name` and return a handle bound to it.
    pub async fn queue_handle(self: &Arc<Self>, name: &str) -> Result<QueueHandle, BusError> {
        self.declare_queue(name).await?;
        Ok(QueueHandle::new(name, self.clone()))
    }

    /// Flush pending publishes and drop the connection.
    pub async fn close(&self) -> Result<(), BusError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        let addr = self.config.server_addr();
        info!(addr = %addr, "closing message bus connection");
        session
            .client
            .flush()
            .await
            .map_err(|err| BusError::Publish {
                queue: "*".to_string(),
                reason: format!("flush on close failed: {err}"),
            })
    }
}

fn session_is_open(session: &Session) -> bool {
    matches!(
        session.client.connection_state(),
        async_nats::connection::State::Connected
    )
}

#[async_trait]
impl Broker for BusTransport {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let session = self.open_session().await?;
        let size_bytes = payload.len();
        let ack = session
            .jetstream
            .publish(queue.to_string(), payload.into())
            .await
            .map_err(|err| BusError::Publish {
                queue: queue.to_string(),
                reason: err.to_string(),
            })?;
        ack.await.map_err(|err| BusError::Publish {
            queue: queue.to_string(),
            reason: format!("broker did not confirm: {err}"),
        })?;
        debug!(queue, size_bytes, "published");
        Ok(())
    }

    /// A delivery is acknowledged only after it was handed to the staging
    /// queue, so anything still in flight at shutdown is redelivered.
    async fn consume_into(
        &self,
        queue: &str,
        consumer_name: &str,
        sink: StagingSender<Vec<u8>>,
        token: CancellationToken,
    ) -> Result<(), BusError> {
        let session = self.open_session().await?;
        let consumer = session
            .jetstream
            .create_consumer_on_stream(
                consumer::pull::Config {
                    durable_name: Some(consumer_name.to_string()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
                queue,
            )
            .await
            .map_err(|err| BusError::Consume {
                queue: queue.to_string(),
                reason: err.to_string(),
            })?;
        info!(queue, consumer = consumer_name, "queue consumer started");

        loop {
            let fetched = tokio::select! {
                _ = token.cancelled() => break,
                fetched = consumer
                    .fetch()
                    .max_messages(self.config.fetch_batch)
                    .expires(self.config.fetch_wait)
                    .messages() => fetched,
            };

            let mut messages = match fetched {
                Ok(messages) => messages,
                Err(err) => {
                    warn!(queue, error = %err, "fetching from queue failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            while let Some(next) = messages.next().await {
                let message = match next {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(queue, error = %err, "receiving delivery failed");
                        continue;
                    }
                };

                let payload = message.payload.to_vec();
                let handed_off = tokio::select! {
                    _ = token.cancelled() => None,
                    put = sink.put(payload) => Some(put),
                };
                match handed_off {
                    None => {
                        info!(queue, "consumer cancelled with a delivery in flight");
                        return Ok(());
                    }
                    Some(Err(_)) => {
                        info!(queue, "staging queue closed; consumer exiting");
                        return Ok(());
                    }
                    Some(Ok(())) => {}
                }

                if let Err(err) = message.ack().await {
                    warn!(queue, error = %err, "acknowledging delivery failed");
                }
            }
        }

        info!(queue, consumer = consumer_name, "queue consumer stopped");
        Ok(())
    }
}

/// In-process bus that records every publish per queue. Consuming removes
/// the delivered messages, like a work queue.
#[derive(Debug, Default)]
pub struct MemoryBus {
    queues: std::sync::Mutex<HashMap<String, Vec<Vec<u8>>>>,
    rejecting: AtomicBool,
    published: Notify,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every publish fails with [`BusError::NotConnected`].
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.get(queue).cloned().unwrap_or_default()
    }

    pub fn messages_as_strings(&self, queue: &str) -> Vec<String> {
        self.messages(queue)
            .into_iter()
            .map(|m| String::from_utf8_lossy(&m).into_owned())
            .collect()
    }

    fn take_pending(&self, queue: &str) -> Vec<Vec<u8>> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.get_mut(queue).map(std::mem::take).unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBus {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(queue.to_string())
            .or_default()
            .push(payload);
        self.published.notify_waiters();
        Ok(())
    }

    async fn consume_into(
        &self,
        queue: &str,
        _consumer_name: &str,
        sink: StagingSender<Vec<u8>>,
        token: CancellationToken,
    ) -> Result<(), BusError> {
        loop {
            // Registered before draining so a publish in between still wakes us.
            let published = self.published.notified();
            for payload in self.take_pending(queue) {
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    put = sink.put(payload) => {
                        if put.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = published => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offerflow_core::staging_queue;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn broker_env(port: &str) -> impl Fn(&str) -> Option<String> {
        lookup_from(&[
            ("RABBITMQ_HOST", "broker.internal"),
            ("RABBITMQ_PORT", port),
            ("RABBITMQ_USERNAME", "offerflow"),
            ("RABBITMQ_PASSWORD", "s3cret"),
        ])
    }

    #[test]
    fn config_reads_broker_settings() {
        let config = BusConfig::from_lookup(&broker_env("4222")).expect("config");
        assert_eq!(config.server_addr(), "nats://broker.internal:4222");
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert!(!format!("{config:?}").contains("s3cret"));
    }

    #[test]
    fn config_rejects_out_of_range_ports() {
        for port in ["0", "65536", "-1", "amqp"] {
            let err = BusConfig::from_lookup(&broker_env(port)).expect_err(port);
            assert!(
                matches!(&err, ConfigError::Invalid { name, .. } if name == "RABBITMQ_PORT"),
                "{port}: {err}"
            );
        }
        assert!(BusConfig::from_lookup(&broker_env("65535")).is_ok());
    }

    #[test]
    fn config_requires_every_broker_variable() {
        let lookup = lookup_from(&[
            ("RABBITMQ_HOST", "broker"),
            ("RABBITMQ_PORT", "4222"),
            ("RABBITMQ_USERNAME", "  "),
        ]);
        assert_eq!(
            BusConfig::from_lookup(&lookup).unwrap_err(),
            ConfigError::Missing("RABBITMQ_USERNAME".into())
        );
    }

    #[tokio::test]
    async fn transport_refuses_work_before_connect() {
        let config = BusConfig::from_lookup(&broker_env("4222")).unwrap();
        let transport = Arc::new(BusTransport::new(config));

        assert!(matches!(
            transport.publish("OfferInput", b"{}".to_vec()).await,
            Err(BusError::NotConnected)
        ));
        assert!(matches!(
            transport.declare_queue("OfferInput").await,
            Err(BusError::NotConnected)
        ));
        assert!(matches!(
            transport.queue_handle("OfferInput").await,
            Err(BusError::NotConnected)
        ));
        transport.close().await.expect("closing an unopened transport");
    }

    #[tokio::test]
    async fn queue_handle_publishes_to_its_queue() {
        let bus = Arc::new(MemoryBus::new());
        let handle = QueueHandle::new("OfferInput", bus.clone());

        handle.send("first").await.unwrap();
        handle.send(b"second".to_vec()).await.unwrap();

        assert_eq!(handle.name(), "OfferInput");
        assert_eq!(bus.messages_as_strings("OfferInput"), ["first", "second"]);
        assert!(bus.messages("ProcessedOffers").is_empty());
    }

    #[tokio::test]
    async fn queue_handle_consumes_into_staging_queue() {
        let bus = Arc::new(MemoryBus::new());
        let handle = QueueHandle::new("ProcessedOffers", bus.clone());
        handle.send("first").await.unwrap();

        let (tx, mut rx) = staging_queue(4);
        let token = CancellationToken::new();
        let consumer = {
            let handle = handle.clone();
            let token = token.clone();
            tokio::spawn(async move { handle.consume_into("sink", tx, token).await })
        };

        assert_eq!(rx.take().await.unwrap(), b"first".to_vec());
        handle.send("second").await.unwrap();
        assert_eq!(rx.take().await.unwrap(), b"second".to_vec());
        assert!(bus.messages("ProcessedOffers").is_empty(), "delivered messages are removed");

        token.cancel();
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejecting_bus_surfaces_an_error() {
        let bus = Arc::new(MemoryBus::new());
        bus.set_rejecting(true);
        let handle = QueueHandle::new("OfferInput", bus.clone());
        assert!(matches!(handle.send("x").await, Err(BusError::NotConnected)));
        assert!(bus.messages("OfferInput").is_empty());
    }
}
