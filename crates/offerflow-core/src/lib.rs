//! Core domain model, transport envelope and stage lifecycle for OfferFlow.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "offerflow-core";

/// Durable queue carrying raw extractor envelopes.
pub const OFFER_INPUT_QUEUE: &str = "OfferInput";
/// Durable queue carrying normalized offers.
pub const PROCESSED_OFFERS_QUEUE: &str = "ProcessedOffers";

/// Date format printed by the offer template (`dd.MM.yyyy`).
pub const OFFER_DATE_FORMAT: &str = "%d.%m.%Y";

pub fn parse_offer_date(value: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(value.trim(), OFFER_DATE_FORMAT)
}

/// Transport payload published to `OfferInput`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEnvelope {
    /// Nested JSON document produced by the extractor.
    pub content: String,
    /// Path of the document the content was extracted from.
    pub path: String,
}

impl RawEnvelope {
    pub fn new(content: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            path: path.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomerDetails {
    pub company_name: String,
    pub address_street: String,
    pub address_house_number: String,
    pub post_code: String,
    pub city: String,
    pub phone: String,
    pub mail: String,
}

impl CustomerDetails {
    /// Deduplication key: `(companyName, addressStreet)`.
    pub fn identity(&self) -> (&str, &str) {
        (&self.company_name, &self.address_street)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: i64,
    #[serde(flatten)]
    pub details: CustomerDetails,
}

/// Position line shared by offers and invoices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub pos_number: i32,
    pub description: String,
    pub amount: i32,
    pub price: Decimal,
}

pub type OfferItem = LineItem;
pub type InvoiceItem = LineItem;

impl LineItem {
    pub fn line_total(&self) -> Decimal {
        self.price * Decimal::from(self.amount)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.amount < 1 {
            return Err(format!(
                "position {} has amount {} (must be at least 1)",
                self.pos_number, self.amount
            ));
        }
        if self.price < Decimal::ZERO {
            return Err(format!(
                "position {} has negative price {}",
                self.pos_number, self.price
            ));
        }
        Ok(())
    }
}

/// Reject item lists that reuse a position number.
pub fn ensure_unique_positions(items: &[LineItem]) -> Result<(), String> {
    let mut seen = std::collections::BTreeSet::new();
    for item in items {
        if !seen.insert(item.pos_number) {
            return Err(format!("position {} appears more than once", item.pos_number));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub offer_number: String,
    pub offer_date: NaiveDate,
    pub offer_valid_till: Option<NaiveDate>,
    pub offer_value: Decimal,
    pub customer_id: i64,
    pub items: Vec<OfferItem>,
}

impl Offer {
    pub fn items_total(&self) -> Decimal {
        self.items.iter().map(LineItem::line_total).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: i64,
    pub invoice_number: String,
    pub invoice_date: NaiveDate,
    pub invoice_total_sum: Decimal,
    /// `None` while the invoice waits for reconciliation.
    pub is_checked: Option<DateTime<Utc>>,
    pub is_valid: bool,
    pub offer_number: Option<String>,
    pub customer_id: i64,
    pub items: Vec<InvoiceItem>,
}

impl Invoice {
    pub fn is_pending(&self) -> bool {
        self.is_checked.is_none()
    }
}

/// Normalized offer republished to `ProcessedOffers` and written by the persistence sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedOffer {
    pub offer_number: String,
    pub offer_value: Decimal,
    pub offer_valid_till: Option<NaiveDate>,
    pub offer_date: NaiveDate,
    pub customer_dto: CustomerDetails,
    pub offer_items_dto: Vec<OfferItem>,
}

impl ProcessedOffer {
    pub fn from_offer(offer: &Offer, customer: &Customer) -> Self {
        Self {
            offer_number: offer.offer_number.clone(),
            offer_value: offer.offer_value,
            offer_valid_till: offer.offer_valid_till,
            offer_date: offer.offer_date,
            customer_dto: customer.details.clone(),
            offer_items_dto: offer.items.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Case-insensitive; blank or unknown values fall back to `Info`.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw.map(|v| v.trim().to_ascii_uppercase()).as_deref() {
            Some("TRACE") => Self::Trace,
            Some("DEBUG") => Self::Debug,
            Some("WARN") => Self::Warn,
            Some("ERROR") => Self::Error,
            _ => Self::Info,
        }
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Self {
        Self::parse_lenient(lookup("LOG_LEVEL").as_deref())
    }

    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_directive().to_ascii_uppercase())
    }
}

/// Environment accessor; production code passes [`process_env`], tests pass a map.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(String),
    #[error("environment variable {name} is invalid: {reason}")]
    Invalid { name: String, reason: String },
}

impl ConfigError {
    pub fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Trimmed value of `name`; unset and blank are both `None`.
pub fn env_optional(lookup: EnvLookup<'_>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_required(lookup: EnvLookup<'_>, name: &str) -> Result<String, ConfigError> {
    env_optional(lookup, name).ok_or_else(|| ConfigError::Missing(name.to_string()))
}

pub fn env_parse_or<T>(lookup: EnvLookup<'_>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env_optional(lookup, name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|err: T::Err| ConfigError::invalid(name, format!("{raw:?}: {err}"))),
    }
}

pub fn env_positive_or(lookup: EnvLookup<'_>, name: &str, default: u64) -> Result<u64, ConfigError> {
    let value = env_parse_or(lookup, name, default)?;
    if value == 0 {
        return Err(ConfigError::invalid(name, "must be greater than zero"));
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
#[error("staging queue is closed")]
pub struct StagingClosed;

/// Bounded in-process queue between an I/O stage and a processing stage.
/// `put` waits while the queue is full.
pub fn staging_queue<T>(capacity: usize) -> (StagingSender<T>, StagingReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (StagingSender { inner: tx }, StagingReceiver { inner: rx })
}

#[derive(Debug)]
pub struct StagingSender<T> {
    inner: mpsc::Sender<T>,
}

impl<T> Clone for StagingSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> StagingSender<T> {
    pub async fn put(&self, item: T) -> Result<(), StagingClosed> {
        self.inner.send(item).await.map_err(|_| StagingClosed)
    }
}

#[derive(Debug)]
pub struct StagingReceiver<T> {
    inner: mpsc::Receiver<T>,
}

impl<T> StagingReceiver<T> {
    /// Next item, or `None` once every sender is gone and the queue is drained.
    pub async fn take(&mut self) -> Option<T> {
        self.inner.recv().await
    }

    /// Like [`take`](Self::take) but returns `None` as soon as `token` is cancelled.
    pub async fn take_or_cancel(&mut self, token: &CancellationToken) -> Option<T> {
        tokio::select! {
            _ = token.cancelled() => None,
            item = self.inner.recv() => item,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Completed,
    Failed(String),
    Panicked,
    TimedOut,
}

/// A long-lived task with a cooperative stop signal.
#[derive(Debug)]
pub struct StageHandle {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl StageHandle {
    pub fn spawn<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let task = run(token.clone());
        let stage = name.clone();
        let handle = tokio::spawn(async move {
            info!(stage = %stage, "stage started");
            task.await
        });
        Self {
            name,
            token,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the stage and wait up to `timeout` for it to finish.
    /// Failures are logged and reported, never propagated.
    pub async fn stop(self, timeout: Duration) -> StopOutcome {
        let Self {
            name,
            token,
            mut handle,
        } = self;
        token.cancel();

        let outcome = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => StopOutcome::Completed,
            Ok(Ok(Err(err))) => StopOutcome::Failed(format!("{err:#}")),
            Ok(Err(join_err)) if join_err.is_panic() => StopOutcome::Panicked,
            Ok(Err(join_err)) => StopOutcome::Failed(join_err.to_string()),
            Err(_) => {
                handle.abort();
                StopOutcome::TimedOut
            }
        };

        match &outcome {
            StopOutcome::Completed => info!(stage = %name, "stage stopped"),
            StopOutcome::Failed(reason) => {
                warn!(stage = %name, error = %reason, "stage stopped with error")
            }
            StopOutcome::Panicked => warn!(stage = %name, "stage panicked"),
            StopOutcome::TimedOut => warn!(
                stage = %name,
                timeout_ms = timeout.as_millis() as u64,
                "stage did not stop in time and was aborted"
            ),
        }
        outcome
    }
}

/// Stop stages one after another in the given order (producers first).
pub async fn shutdown_in_order(
    stages: Vec<StageHandle>,
    timeout_per_stage: Duration,
) -> Vec<(String, StopOutcome)> {
    let mut outcomes = Vec::with_capacity(stages.len());
    for stage in stages {
        let name = stage.name().to_string();
        let outcome = stage.stop(timeout_per_stage).await;
        outcomes.push((name, outcome));
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn sample_customer() -> Customer {
        Customer {
            id: 7,
            details: CustomerDetails {
                company_name: "Muster GmbH".into(),
                address_street: "Hauptstrasse".into(),
                address_house_number: "12".into(),
                post_code: "83022".into(),
                city: "Rosenheim".into(),
                phone: "08031 1234".into(),
                mail: "info@muster.de".into(),
            },
        }
    }

    #[test]
    fn log_level_parsing_is_lenient() {
        assert_eq!(LogLevel::parse_lenient(Some("debug")), LogLevel::Debug);
        assert_eq!(LogLevel::parse_lenient(Some("  WARN ")), LogLevel::Warn);
        assert_eq!(LogLevel::parse_lenient(Some("Error")), LogLevel::Error);
        assert_eq!(LogLevel::parse_lenient(Some("")), LogLevel::Info);
        assert_eq!(LogLevel::parse_lenient(Some("verbose")), LogLevel::Info);
        assert_eq!(LogLevel::parse_lenient(None), LogLevel::Info);
    }

    #[test]
    fn log_level_comes_from_the_environment() {
        let lookup = lookup_from(&[("LOG_LEVEL", "debug")]);
        assert_eq!(LogLevel::from_lookup(&lookup), LogLevel::Debug);
        assert_eq!(LogLevel::from_lookup(&lookup).as_directive(), "debug");

        let unset = lookup_from(&[]);
        assert_eq!(LogLevel::from_lookup(&unset), LogLevel::Info);
    }

    #[test]
    fn required_env_rejects_blank_values() {
        let lookup = lookup_from(&[("HOST", "   "), ("USER", " guest ")]);
        assert_eq!(
            env_required(&lookup, "HOST"),
            Err(ConfigError::Missing("HOST".into()))
        );
        assert_eq!(env_required(&lookup, "USER").unwrap(), "guest");
        assert!(matches!(
            env_required(&lookup, "PASSWORD"),
            Err(ConfigError::Missing(name)) if name == "PASSWORD"
        ));
    }

    #[test]
    fn numeric_env_values_are_validated() {
        let lookup = lookup_from(&[("MAX_FILE_SIZE", "abc"), ("ZERO", "0"), ("OK", "42")]);
        assert!(matches!(
            env_positive_or(&lookup, "MAX_FILE_SIZE", 10),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            env_positive_or(&lookup, "ZERO", 10),
            Err(ConfigError::Invalid { .. })
        ));
        assert_eq!(env_positive_or(&lookup, "OK", 10).unwrap(), 42);
        assert_eq!(env_positive_or(&lookup, "UNSET", 10).unwrap(), 10);
    }

    #[test]
    fn offer_dates_use_day_month_year() {
        let date = parse_offer_date("05.03.2024").expect("date");
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert!(parse_offer_date("2024-03-05").is_err());
    }

    #[test]
    fn processed_offer_serializes_iso_dates_and_camel_case() {
        let offer = Offer {
            offer_number: "A-100".into(),
            offer_date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            offer_valid_till: NaiveDate::from_ymd_opt(2024, 4, 5),
            offer_value: Decimal::new(25000, 2),
            customer_id: 7,
            items: vec![LineItem {
                pos_number: 1,
                description: "Beratung".into(),
                amount: 2,
                price: Decimal::new(12500, 2),
            }],
        };
        let processed = ProcessedOffer::from_offer(&offer, &sample_customer());
        let json = serde_json::to_value(&processed).unwrap();

        assert_eq!(json["offerDate"], "2024-03-05");
        assert_eq!(json["offerValidTill"], "2024-04-05");
        assert_eq!(json["customerDto"]["companyName"], "Muster GmbH");
        assert_eq!(json["offerItemsDto"][0]["posNumber"], 1);
        assert_eq!(offer.items_total(), Decimal::new(25000, 2));
    }

    #[test]
    fn line_item_validation_rejects_zero_amount_and_negative_price() {
        let mut item = LineItem {
            pos_number: 3,
            description: "Montage".into(),
            amount: 0,
            price: Decimal::new(100, 0),
        };
        assert!(item.validate().is_err());
        item.amount = 1;
        item.price = Decimal::new(-1, 0);
        assert!(item.validate().is_err());
        item.price = Decimal::ZERO;
        assert!(item.validate().is_ok());
    }

    #[test]
    fn duplicate_positions_are_detected() {
        let item = LineItem {
            pos_number: 1,
            description: "x".into(),
            amount: 1,
            price: Decimal::ONE,
        };
        assert!(ensure_unique_positions(&[item.clone()]).is_ok());
        assert!(ensure_unique_positions(&[item.clone(), item]).is_err());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn full_staging_queue_applies_backpressure() {
        let (tx, mut rx) = staging_queue::<u32>(1);
        tx.put(1).await.expect("first put");

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.put(2)).await;
        assert!(blocked.is_err(), "second put should wait for capacity");

        assert_eq!(rx.take().await, Some(1));
        tx.put(3).await.expect("put after take");
        assert_eq!(rx.take().await, Some(3));

        drop(tx);
        assert_eq!(rx.take().await, None);
    }

    #[tokio::test]
    async fn take_or_cancel_returns_none_when_cancelled() {
        let (_tx, mut rx) = staging_queue::<u32>(4);
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(rx.take_or_cancel(&token).await, None);
    }

    #[tokio::test]
    async fn stages_stop_cooperatively_and_report_failures() {
        let clean = StageHandle::spawn("clean", |token| async move {
            token.cancelled().await;
            anyhow::Ok(())
        });
        let failing = StageHandle::spawn("failing", |token| async move {
            token.cancelled().await;
            Err::<(), _>(anyhow::anyhow!("flush failed"))
        });
        let panicking = StageHandle::spawn("panicking", |token| async move {
            token.cancelled().await;
            let explode = true;
            if explode {
                panic!("boom");
            }
            anyhow::Ok(())
        });
        let stuck = StageHandle::spawn("stuck", |_token| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            anyhow::Ok(())
        });

        let outcomes =
            shutdown_in_order(vec![clean, failing, panicking, stuck], Duration::from_millis(200))
                .await;

        let names: Vec<_> = outcomes.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["clean", "failing", "panicking", "stuck"]);
        assert_eq!(outcomes[0].1, StopOutcome::Completed);
        assert!(matches!(&outcomes[1].1, StopOutcome::Failed(msg) if msg.contains("flush failed")));
        assert_eq!(outcomes[2].1, StopOutcome::Panicked);
        assert_eq!(outcomes[3].1, StopOutcome::TimedOut);
    }
}
