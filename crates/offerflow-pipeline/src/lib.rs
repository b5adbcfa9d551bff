//! Ingestion side of the pipeline service: turns raw `OfferInput` envelopes
//! into stored offers and republishes them on `ProcessedOffers`.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use offerflow_bus::{BusError, QueueHandle};
use offerflow_core::{
    env_parse_or, env_positive_or, parse_offer_date, process_env, ConfigError, CustomerDetails,
    EnvLookup, LineItem, ProcessedOffer, StagingReceiver,
};
use offerflow_db::{DatabaseConfig, NewOffer, Repository, RepositoryError};
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "offerflow-pipeline";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,
    pub matching_interval: Duration,
    pub web_port: u16,
    pub staging_capacity: usize,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let web_port: u16 = env_parse_or(lookup, "WEB_PORT", 8080)?;
        if web_port == 0 {
            return Err(ConfigError::invalid("WEB_PORT", "must be between 1 and 65535"));
        }
        Ok(Self {
            database: DatabaseConfig::from_lookup(lookup)?,
            matching_interval: Duration::from_secs(env_positive_or(
                lookup,
                "MATCHING_INTERVAL_SECS",
                60,
            )?),
            web_port,
            staging_capacity: env_positive_or(lookup, "STAGING_QUEUE_CAPACITY", 10)? as usize,
        })
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed envelope: {0}")]
    Envelope(serde_json::Error),
    #[error("malformed offer content: {0}")]
    Content(serde_json::Error),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("{field} is not a dd.MM.yyyy date: {value:?}")]
    InvalidDate { field: &'static str, value: String },
    #[error("{field} is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("encoding processed offer: {0}")]
    Encode(serde_json::Error),
    #[error(transparent)]
    Publish(#[from] BusError),
}

/// Offer content decoded from an envelope, before persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingOffer {
    pub customer: CustomerDetails,
    pub offer: NewOffer,
}

/// Text view of a JSON field: strings are trimmed, numbers and booleans are
/// rendered, anything else is empty.
fn text_value(node: &Value, key: &str) -> String {
    match node.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn required_text(node: &Value, key: &'static str) -> Result<String, IngestError> {
    let value = text_value(node, key);
    if value.is_empty() {
        return Err(IngestError::MissingField(key));
    }
    Ok(value)
}

fn date_value(node: &Value, key: &'static str) -> Result<NaiveDate, IngestError> {
    let raw = required_text(node, key)?;
    parse_offer_date(&raw).map_err(|_| IngestError::InvalidDate {
        field: key,
        value: raw,
    })
}

fn decimal_value(node: &Value, key: &'static str) -> Result<Decimal, IngestError> {
    let raw = required_text(node, key)?;
    Decimal::from_str(&raw).map_err(|_| IngestError::InvalidNumber {
        field: key,
        value: raw,
    })
}

fn int_value(node: &Value, key: &'static str) -> Result<i32, IngestError> {
    let raw = required_text(node, key)?;
    raw.parse().map_err(|_| IngestError::InvalidNumber {
        field: key,
        value: raw,
    })
}

/// Decode one `OfferInput` message.
///
/// The envelope's `content` is usually a JSON document serialized into a
/// string; an inline object is accepted as well. An empty `validTillDate`
/// means the offer has no validity date.
pub fn parse_payload(payload: &[u8]) -> Result<IncomingOffer, IngestError> {
    let envelope: Value = serde_json::from_slice(payload).map_err(IngestError::Envelope)?;
    let content = match envelope.get("content") {
        Some(Value::String(raw)) => serde_json::from_str(raw).map_err(IngestError::Content)?,
        Some(object @ Value::Object(_)) => object.clone(),
        _ => return Err(IngestError::MissingField("content")),
    };

    let customer = CustomerDetails {
        company_name: required_text(&content, "companyName")?,
        address_street: text_value(&content, "addressStreet"),
        address_house_number: text_value(&content, "addressHouseNumber"),
        post_code: text_value(&content, "postCode"),
        city: text_value(&content, "city"),
        phone: text_value(&content, "phone"),
        mail: text_value(&content, "mail"),
    };

    let valid_till_raw = text_value(&content, "validTillDate");
    let offer_valid_till = if valid_till_raw.is_empty() {
        None
    } else {
        Some(
            parse_offer_date(&valid_till_raw).map_err(|_| IngestError::InvalidDate {
                field: "validTillDate",
                value: valid_till_raw.clone(),
            })?,
        )
    };

    let items = content
        .get("invoiceItems")
        .and_then(Value::as_array)
        .ok_or(IngestError::MissingField("invoiceItems"))?
        .iter()
        .map(|item| {
            Ok(LineItem {
                pos_number: int_value(item, "posNumber")?,
                description: text_value(item, "description"),
                amount: int_value(item, "amount")?,
                price: decimal_value(item, "price")?,
            })
        })
        .collect::<Result<Vec<_>, IngestError>>()?;

    Ok(IncomingOffer {
        customer,
        offer: NewOffer {
            offer_number: required_text(&content, "offerNumber")?,
            offer_date: date_value(&content, "offerDate")?,
            offer_valid_till,
            offer_value: decimal_value(&content, "totalPrice")?,
            items,
        },
    })
}

/// Stores each incoming offer and republishes the normalized form.
pub struct OfferNormalizer {
    repository: Arc<dyn Repository>,
    processed: QueueHandle,
}

impl OfferNormalizer {
    pub fn new(repository: Arc<dyn Repository>, processed: QueueHandle) -> Self {
        Self {
            repository,
            processed,
        }
    }

    pub async fn process(&self, payload: &[u8]) -> Result<ProcessedOffer, IngestError> {
        let incoming = parse_payload(payload)?;
        let (customer, offer) = self
            .repository
            .record_offer(&incoming.customer, &incoming.offer)
            .await?;
        info!(
            offer_number = %offer.offer_number,
            customer_id = customer.id,
            items = offer.items.len(),
            "offer stored"
        );

        let processed = ProcessedOffer::from_offer(&offer, &customer);
        let body = serde_json::to_vec(&processed).map_err(IngestError::Encode)?;
        self.processed.send(body).await?;
        debug!(offer_number = %offer.offer_number, queue = self.processed.name(), "processed offer published");
        Ok(processed)
    }

    pub async fn run(
        &self,
        mut inbox: StagingReceiver<Vec<u8>>,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        info!("offer normalizer started");
        while let Some(payload) = inbox.take_or_cancel(&token).await {
            match self.process(&payload).await {
                Ok(_) => {}
                Err(IngestError::Repository(RepositoryError::DuplicateOffer(number))) => {
                    warn!(offer_number = %number, "offer already stored; message dropped");
                }
                Err(err) => error!(
                    error = %err,
                    payload = %String::from_utf8_lossy(&payload),
                    "offer message dropped"
                ),
            }
        }
        info!("offer normalizer stopped");
        Ok(())
    }
}
