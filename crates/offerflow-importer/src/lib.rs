//! Offer document import: directory polling, file stabilization, text
//! extraction and the line-position parser for the offer template.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use offerflow_bus::{BusError, BusTransport, QueueHandle};
use offerflow_core::{
    env_optional, env_positive_or, process_env, ConfigError, EnvLookup, LineItem,
    RawEnvelope, StagingClosed, StagingReceiver, StagingSender, OFFER_INPUT_QUEUE,
};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "offerflow-importer";

pub const DOCUMENT_EXTENSION: &str = "pdf";

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStrategy {
    Logging,
    MessageBus,
}

impl DispatchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Logging => "LoggingStrategy",
            Self::MessageBus => "MessageBusStrategy",
        }
    }
}

impl FromStr for DispatchStrategy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "LoggingStrategy" => Ok(Self::Logging),
            "MessageBusStrategy" => Ok(Self::MessageBus),
            other => Err(format!(
                "{other:?} is not one of LoggingStrategy, MessageBusStrategy"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StabilityConfig {
    pub probe_interval: Duration,
    pub max_probes: usize,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(300),
            max_probes: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImporterConfig {
    pub offers_dir: PathBuf,
    pub max_file_size_mb: u64,
    pub poll_interval: Duration,
    pub strategy: DispatchStrategy,
    pub staging_capacity: usize,
    pub stability: StabilityConfig,
}

impl ImporterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let max_file_size_mb = env_positive_or(lookup, "MAX_FILE_SIZE", 10)?;

        let offers_dir =
            PathBuf::from(env_optional(lookup, "PATH_OFFERS").unwrap_or_else(|| ".".to_string()));
        if !offers_dir.exists() {
            return Err(ConfigError::invalid(
                "PATH_OFFERS",
                format!("{} does not exist", offers_dir.display()),
            ));
        }
        if !offers_dir.is_dir() {
            return Err(ConfigError::invalid(
                "PATH_OFFERS",
                format!("{} is not a directory", offers_dir.display()),
            ));
        }

        let poll_secs = env_positive_or(lookup, "POLL_INTERVAL_SECS", 5)?;
        let strategy = match env_optional(lookup, "OFFER_STRATEGY") {
            None => DispatchStrategy::MessageBus,
            Some(raw) => raw
                .parse()
                .map_err(|reason: String| ConfigError::invalid("OFFER_STRATEGY", reason))?,
        };
        let staging_capacity = env_positive_or(lookup, "STAGING_QUEUE_CAPACITY", 10)?;

        Ok(Self {
            offers_dir,
            max_file_size_mb,
            poll_interval: Duration::from_secs(poll_secs),
            strategy,
            staging_capacity: staging_capacity as usize,
            stability: StabilityConfig::default(),
        })
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(BYTES_PER_MB)
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("document has no line {index} ({field})")]
    MissingLine { index: usize, field: &'static str },
    #[error("line {index} ({field}) is malformed: {line:?}")]
    MalformedLine {
        index: usize,
        field: &'static str,
        line: String,
    },
    #[error("document has no total price line")]
    MissingTotal,
    #[error("{field} is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("order line is malformed: {0:?}")]
    MalformedItem(String),
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} kept growing after {probes} size probes", path.display())]
    Unstable { path: PathBuf, probes: usize },
    #[error("extracting text from {}: {reason}", path.display())]
    Extract { path: PathBuf, reason: String },
    #[error("parsing {}: {source}", path.display())]
    Parse { path: PathBuf, source: ParseError },
    #[error("encoding envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    QueueClosed(#[from] StagingClosed),
}

impl ImportError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Structured content extracted from one offer document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedOffer {
    pub company_name: String,
    pub address_street: String,
    pub address_house_number: String,
    pub post_code: String,
    pub city: String,
    pub phone: String,
    pub mail: String,
    pub offer_number: String,
    pub offer_date: String,
    pub total_price: Decimal,
    /// Empty when the document carries no validity date.
    pub valid_till_date: String,
    pub invoice_items: Vec<LineItem>,
}

/// Parser for the single known offer template.
///
/// Header fields sit on fixed lines (0-based):
///
/// | line | content                         |
/// |------|---------------------------------|
/// | 1    | company name                    |
/// | 2    | `<street> <house number>`       |
/// | 3    | `<post code> <city>`            |
/// | 4    | `<label>: <phone>`              |
/// | 5    | `<label>: <mail>`               |
/// | 11   | `<label> <offer number>`        |
/// | 12   | `<label> <offer date>`          |
///
/// The total comes from the first `Gesamtpreis:` line, the validity date
/// from `gültig bis zum dd.mm.yyyy`, and order lines start with `B<pos>`.
#[derive(Debug, Clone)]
pub struct OfferLayoutParser {
    valid_till: Regex,
    order_line: Regex,
}

impl OfferLayoutParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            valid_till: Regex::new(r"gültig bis zum (\d{2}\.\d{2}\.\d{4})")?,
            order_line: Regex::new(r"^B(\d+)\b")?,
        })
    }

    pub fn parse(&self, text: &str) -> Result<ExtractedOffer, ParseError> {
        let lines: Vec<&str> = text.lines().collect();

        let company_name = line_at(&lines, 1, "company name")?;

        let street_line = line_at(&lines, 2, "street")?;
        let (address_street, address_house_number) = street_line
            .rsplit_once(char::is_whitespace)
            .map(|(street, number)| (street.trim(), number.trim()))
            .ok_or_else(|| malformed(2, "street", street_line))?;

        let city_line = line_at(&lines, 3, "post code and city")?;
        let (post_code, city) = city_line
            .split_once(char::is_whitespace)
            .map(|(code, city)| (code.trim(), city.trim()))
            .ok_or_else(|| malformed(3, "post code and city", city_line))?;

        let phone = after_label(&lines, 4, "phone")?;
        let mail = after_label(&lines, 5, "mail")?;
        let offer_number = second_token(&lines, 11, "offer number")?;
        let offer_date = second_token(&lines, 12, "offer date")?;
        let total_price = total_price(&lines)?;

        let valid_till_date = self
            .valid_till
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        let invoice_items = lines
            .iter()
            .map(|line| line.trim())
            .filter(|line| self.order_line.is_match(line))
            .map(|line| self.parse_order_line(line))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ExtractedOffer {
            company_name: company_name.to_string(),
            address_street: address_street.to_string(),
            address_house_number: address_house_number.to_string(),
            post_code: post_code.to_string(),
            city: city.to_string(),
            phone: phone.to_string(),
            mail: mail.to_string(),
            offer_number: offer_number.to_string(),
            offer_date: offer_date.to_string(),
            total_price,
            valid_till_date,
            invoice_items,
        })
    }

    /// `B<pos> <description...> <amount> <price>`
    fn parse_order_line(&self, line: &str) -> Result<LineItem, ParseError> {
        let pos_number = self
            .order_line
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<i32>().ok())
            .ok_or_else(|| ParseError::MalformedItem(line.to_string()))?;

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(ParseError::MalformedItem(line.to_string()));
        }
        let amount_raw = parts[parts.len() - 2];
        let price_raw = parts[parts.len() - 1];

        let amount = amount_raw
            .parse::<i32>()
            .map_err(|_| ParseError::InvalidNumber {
                field: "amount",
                value: amount_raw.to_string(),
            })?;
        let price = Decimal::from_str(price_raw).map_err(|_| ParseError::InvalidNumber {
            field: "price",
            value: price_raw.to_string(),
        })?;

        Ok(LineItem {
            pos_number,
            description: parts[1..parts.len() - 2].join(" "),
            amount,
            price,
        })
    }
}

fn malformed(index: usize, field: &'static str, line: &str) -> ParseError {
    ParseError::MalformedLine {
        index,
        field,
        line: line.to_string(),
    }
}

fn line_at<'a>(lines: &[&'a str], index: usize, field: &'static str) -> Result<&'a str, ParseError> {
    lines
        .get(index)
        .map(|line| (*line).trim())
        .filter(|line| !line.is_empty())
        .ok_or(ParseError::MissingLine { index, field })
}

fn after_label<'a>(lines: &[&'a str], index: usize, field: &'static str) -> Result<&'a str, ParseError> {
    let line = line_at(lines, index, field)?;
    line.split_once(':')
        .map(|(_, value)| value.trim())
        .ok_or_else(|| malformed(index, field, line))
}

fn second_token<'a>(lines: &[&'a str], index: usize, field: &'static str) -> Result<&'a str, ParseError> {
    let line = line_at(lines, index, field)?;
    line.split_whitespace()
        .nth(1)
        .ok_or_else(|| malformed(index, field, line))
}

fn total_price(lines: &[&str]) -> Result<Decimal, ParseError> {
    let line = lines
        .iter()
        .find(|line| line.contains("Gesamtpreis:"))
        .ok_or(ParseError::MissingTotal)?;
    let raw = line
        .split_once(':')
        .map(|(_, rest)| rest.trim())
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or_default();
    Decimal::from_str(raw).map_err(|_| ParseError::InvalidNumber {
        field: "total price",
        value: raw.to_string(),
    })
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<String, ImportError>;
}

/// Extracts text from PDF documents on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfTextExtractor;

#[async_trait]
impl TextExtractor for PdfTextExtractor {
    async fn extract(&self, path: &Path) -> Result<String, ImportError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| ImportError::io(path, err))?;
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .map_err(|err| ImportError::Extract {
                path: path.to_path_buf(),
                reason: format!("extraction task failed: {err}"),
            })?
            .map_err(|err| ImportError::Extract {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })
    }
}

/// Reads the file as UTF-8 text (documents already converted to text).
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, path: &Path) -> Result<String, ImportError> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|err| ImportError::io(path, err))
    }
}

pub fn is_document(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(DOCUMENT_EXTENSION))
}

/// Polling change detector for one directory (non-recursive).
///
/// A path is reported when it is new or its modification time differs from
/// the cached one. Non-document files are tracked but never reported.
#[derive(Debug)]
pub struct DirectoryWatcher {
    dir: PathBuf,
    seen: HashMap<PathBuf, SystemTime>,
}

impl DirectoryWatcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seen: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record what is already present so only later changes are reported.
    pub async fn prime(&mut self) -> Result<usize, ImportError> {
        let present = self.list().await?;
        let count = present.len();
        self.seen = present.into_iter().collect();
        Ok(count)
    }

    pub async fn scan(&mut self) -> Result<Vec<PathBuf>, ImportError> {
        let present = self.list().await?;
        let mut changed = Vec::new();
        let mut still_present = HashSet::with_capacity(present.len());

        for (path, modified) in present {
            still_present.insert(path.clone());
            if self.seen.get(&path) == Some(&modified) {
                continue;
            }
            self.seen.insert(path.clone(), modified);
            if is_document(&path) {
                changed.push(path);
            } else {
                debug!(path = %path.display(), "ignoring non-document file");
            }
        }

        self.seen.retain(|path, _| still_present.contains(path));
        changed.sort();
        Ok(changed)
    }

    /// Overwrite the cached modification time, e.g. after a file settled.
    pub fn remember(&mut self, path: &Path, modified: SystemTime) {
        self.seen.insert(path.to_path_buf(), modified);
    }

    async fn list(&self) -> Result<Vec<(PathBuf, SystemTime)>, ImportError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|err| ImportError::io(&self.dir, err))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| ImportError::io(&self.dir, err))?
        {
            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata
                .modified()
                .map_err(|err| ImportError::io(&path, err))?;
            files.push((path, modified));
        }
        Ok(files)
    }
}

/// Poll the file size until two consecutive probes agree.
pub async fn wait_until_stable(path: &Path, config: &StabilityConfig) -> Result<u64, ImportError> {
    let mut previous = file_size(path).await?;
    for _ in 0..config.max_probes {
        tokio::time::sleep(config.probe_interval).await;
        let current = file_size(path).await?;
        if current == previous {
            return Ok(current);
        }
        previous = current;
    }
    Err(ImportError::Unstable {
        path: path.to_path_buf(),
        probes: config.max_probes,
    })
}

async fn file_size(path: &Path) -> Result<u64, ImportError> {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .map_err(|err| ImportError::io(path, err))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Enqueued { bytes: u64 },
    Oversize { bytes: u64, limit: u64 },
}

/// Turns settled documents into envelopes on the staging queue.
pub struct FileImporter {
    config: ImporterConfig,
    extractor: Arc<dyn TextExtractor>,
    parser: OfferLayoutParser,
    outbox: StagingSender<String>,
}

impl FileImporter {
    pub fn new(
        config: ImporterConfig,
        extractor: Arc<dyn TextExtractor>,
        outbox: StagingSender<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            config,
            extractor,
            parser: OfferLayoutParser::new()?,
            outbox,
        })
    }

    pub async fn import_file(&self, path: &Path) -> Result<ImportOutcome, ImportError> {
        let bytes = wait_until_stable(path, &self.config.stability).await?;
        let limit = self.config.max_file_size_bytes();
        if bytes > limit {
            warn!(
                path = %path.display(),
                bytes,
                limit,
                "document exceeds the size limit; skipped"
            );
            return Ok(ImportOutcome::Oversize { bytes, limit });
        }

        let text = self.extractor.extract(path).await?;
        let offer = self.parser.parse(&text).map_err(|source| ImportError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let content = serde_json::to_string(&offer)?;
        let envelope = RawEnvelope::new(content, path.display().to_string()).to_json()?;
        self.outbox.put(envelope).await?;

        info!(
            path = %path.display(),
            offer_number = %offer.offer_number,
            items = offer.invoice_items.len(),
            "offer document enqueued"
        );
        Ok(ImportOutcome::Enqueued { bytes })
    }

    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        let mut watcher = DirectoryWatcher::new(&self.config.offers_dir);
        let existing = watcher.prime().await?;
        info!(
            dir = %self.config.offers_dir.display(),
            existing,
            poll_secs = self.config.poll_interval.as_secs_f64(),
            "watching for offer documents"
        );

        'poll: loop {
            match watcher.scan().await {
                Ok(changed) => {
                    for path in changed {
                        let result = tokio::select! {
                            _ = token.cancelled() => break 'poll,
                            result = self.import_file(&path) => result,
                        };
                        match result {
                            Ok(_) => {}
                            Err(ImportError::QueueClosed(_)) => {
                                info!("staging queue closed; watcher exiting");
                                break 'poll;
                            }
                            Err(err) => warn!(path = %path.display(), error = %err, "document skipped"),
                        }
                        if let Ok(modified) = tokio::fs::metadata(&path).await.and_then(|m| m.modified())
                        {
                            watcher.remember(&path, modified);
                        }
                    }
                }
                Err(err) => warn!(error = %err, "scanning offer directory failed"),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("offer directory watcher stopped");
        Ok(())
    }
}

/// What happens to an extracted payload.
#[derive(Debug, Clone)]
pub enum OfferDispatch {
    Logging,
    Bus(QueueHandle),
}

impl OfferDispatch {
    /// Connect the transport and bind to `OfferInput`.
    pub async fn message_bus(transport: &Arc<BusTransport>) -> Result<Self, BusError> {
        transport.connect().await?;
        Ok(Self::Bus(transport.queue_handle(OFFER_INPUT_QUEUE).await?))
    }

    pub async fn handle(&self, payload: &str) -> Result<(), BusError> {
        match self {
            Self::Logging => {
                info!(payload = %payload, "extracted offer");
                Ok(())
            }
            Self::Bus(queue) => {
                queue.send(payload.as_bytes().to_vec()).await?;
                debug!(queue = queue.name(), bytes = payload.len(), "offer dispatched");
                Ok(())
            }
        }
    }
}

/// Drains the staging queue into the dispatch strategy.
#[derive(Debug)]
pub struct DocumentProcessor {
    dispatch: OfferDispatch,
}

impl DocumentProcessor {
    pub fn new(dispatch: OfferDispatch) -> Self {
        Self { dispatch }
    }

    pub async fn run(
        &self,
        mut inbox: StagingReceiver<String>,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        while let Some(payload) = inbox.take_or_cancel(&token).await {
            if let Err(err) = self.dispatch.handle(&payload).await {
                error!(error = %err, payload = %payload, "dispatching offer failed");
            }
        }
        info!("document processor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offerflow_bus::MemoryBus;
    use offerflow_core::staging_queue;
    use tempfile::tempdir;

    const SAMPLE_OFFER: &str = "Angebot
Muster GmbH
Lange Straße 12
83022 Rosenheim
Tel: 08031 12345
Mail: info@muster.de

Kunde
Beispiel AG
Ringweg 1
80331 München
Angebotsnummer: A-2024-001
Angebotsdatum: 05.03.2024
Pos Beschreibung Menge Preis
B1 Beratung vor Ort 2 125.00
B2 Installation 1 300.50
Gesamtpreis: 550.50 EUR
Dieses Angebot ist gültig bis zum 05.04.2024.
";

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn test_config(dir: &Path) -> ImporterConfig {
        ImporterConfig {
            offers_dir: dir.to_path_buf(),
            max_file_size_mb: 1,
            poll_interval: Duration::from_millis(20),
            strategy: DispatchStrategy::Logging,
            staging_capacity: 10,
            stability: StabilityConfig {
                probe_interval: Duration::from_millis(10),
                max_probes: 50,
            },
        }
    }

    #[test]
    fn config_defaults_and_validation() {
        let dir = tempdir().expect("tempdir");
        let dir_str = dir.path().to_str().unwrap();

        let config = ImporterConfig::from_lookup(&lookup_from(&[("PATH_OFFERS", dir_str)]))
            .expect("defaults");
        assert_eq!(config.max_file_size_mb, 10);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.strategy, DispatchStrategy::MessageBus);
        assert_eq!(config.staging_capacity, 10);
        assert_eq!(config.max_file_size_bytes(), 10 * 1024 * 1024);

        let config = ImporterConfig::from_lookup(&lookup_from(&[
            ("PATH_OFFERS", dir_str),
            ("OFFER_STRATEGY", "LoggingStrategy"),
        ]))
        .expect("logging strategy");
        assert_eq!(config.strategy, DispatchStrategy::Logging);

        for (key, value) in [
            ("MAX_FILE_SIZE", "ten"),
            ("MAX_FILE_SIZE", "0"),
            ("OFFER_STRATEGY", "KafkaStrategy"),
        ] {
            let err = ImporterConfig::from_lookup(&lookup_from(&[("PATH_OFFERS", dir_str), (key, value)]))
                .expect_err(value);
            assert!(matches!(&err, ConfigError::Invalid { name, .. } if name == key), "{err}");
        }
    }

    #[test]
    fn offers_path_must_be_an_existing_directory() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("offer.pdf");
        std::fs::write(&file, b"x").unwrap();

        for path in [dir.path().join("missing"), file] {
            let path = path.to_str().unwrap().to_string();
            let err = ImporterConfig::from_lookup(&lookup_from(&[("PATH_OFFERS", path.as_str())]))
                .expect_err("invalid path");
            assert!(matches!(&err, ConfigError::Invalid { name, .. } if name == "PATH_OFFERS"));
        }
    }

    #[test]
    fn parser_reads_the_offer_template() {
        let parser = OfferLayoutParser::new().unwrap();
        let offer = parser.parse(SAMPLE_OFFER).expect("parse");

        assert_eq!(offer.company_name, "Muster GmbH");
        assert_eq!(offer.address_street, "Lange Straße");
        assert_eq!(offer.address_house_number, "12");
        assert_eq!(offer.post_code, "83022");
        assert_eq!(offer.city, "Rosenheim");
        assert_eq!(offer.phone, "08031 12345");
        assert_eq!(offer.mail, "info@muster.de");
        assert_eq!(offer.offer_number, "A-2024-001");
        assert_eq!(offer.offer_date, "05.03.2024");
        assert_eq!(offer.total_price, Decimal::new(55050, 2));
        assert_eq!(offer.valid_till_date, "05.04.2024");

        assert_eq!(offer.invoice_items.len(), 2);
        let first = &offer.invoice_items[0];
        assert_eq!(first.pos_number, 1);
        assert_eq!(first.description, "Beratung vor Ort");
        assert_eq!(first.amount, 2);
        assert_eq!(first.price, Decimal::new(12500, 2));
        assert_eq!(offer.invoice_items[1].pos_number, 2);
    }

    #[test]
    fn parser_serializes_extractor_keys() {
        let parser = OfferLayoutParser::new().unwrap();
        let json = serde_json::to_value(parser.parse(SAMPLE_OFFER).unwrap()).unwrap();
        for key in [
            "companyName",
            "addressStreet",
            "addressHouseNumber",
            "postCode",
            "city",
            "phone",
            "mail",
            "offerNumber",
            "offerDate",
            "totalPrice",
            "validTillDate",
            "invoiceItems",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["invoiceItems"][0]["posNumber"], 1);
    }

    #[test]
    fn house_number_is_the_last_token_of_the_street_line() {
        let parser = OfferLayoutParser::new().unwrap();
        let text = SAMPLE_OFFER.replace("Lange Straße 12", "Am Alten Hof 12");
        let offer = parser.parse(&text).unwrap();
        assert_eq!(offer.address_street, "Am Alten Hof");
        assert_eq!(offer.address_house_number, "12");
    }

    #[test]
    fn missing_validity_date_yields_empty_string() {
        let parser = OfferLayoutParser::new().unwrap();
        let text = SAMPLE_OFFER.replace("Dieses Angebot ist gültig bis zum 05.04.2024.", "");
        assert_eq!(parser.parse(&text).unwrap().valid_till_date, "");
    }

    #[test]
    fn parser_rejects_incomplete_documents() {
        let parser = OfferLayoutParser::new().unwrap();
        assert!(matches!(
            parser.parse("Angebot\nMuster GmbH\n"),
            Err(ParseError::MissingLine { index: 2, .. })
        ));

        let without_total = SAMPLE_OFFER.replace("Gesamtpreis: 550.50 EUR", "");
        assert!(matches!(
            parser.parse(&without_total),
            Err(ParseError::MissingTotal)
        ));

        let bad_item = SAMPLE_OFFER.replace("B2 Installation 1 300.50", "B2 Installation eins 300.50");
        assert!(matches!(
            parser.parse(&bad_item),
            Err(ParseError::InvalidNumber { field: "amount", .. })
        ));
    }

    #[test]
    fn only_pdf_extensions_count_as_documents() {
        assert!(is_document(Path::new("/in/offer.pdf")));
        assert!(is_document(Path::new("/in/OFFER.PDF")));
        assert!(!is_document(Path::new("/in/offer.txt")));
        assert!(!is_document(Path::new("/in/pdf")));
    }

    #[tokio::test]
    async fn watcher_reports_new_and_changed_documents_once() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("old.pdf"), b"old").unwrap();

        let mut watcher = DirectoryWatcher::new(dir.path());
        assert_eq!(watcher.prime().await.unwrap(), 1);
        assert!(watcher.scan().await.unwrap().is_empty());

        let fresh = dir.path().join("Fresh.PDF");
        std::fs::write(&fresh, b"new").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        assert_eq!(watcher.scan().await.unwrap(), vec![fresh.clone()]);
        assert!(watcher.scan().await.unwrap().is_empty());

        let file = std::fs::OpenOptions::new().write(true).open(&fresh).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();
        assert_eq!(watcher.scan().await.unwrap(), vec![fresh]);
    }

    #[tokio::test]
    async fn stable_file_reports_its_size() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("offer.pdf");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();

        let size = wait_until_stable(&path, &test_config(dir.path()).stability)
            .await
            .expect("stable");
        assert_eq!(size, 2048);
    }

    #[tokio::test]
    async fn growing_file_is_never_reported_stable() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("growing.pdf");
        std::fs::write(&path, b"%PDF").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&writer_path)
                .await
                .unwrap();
            for _ in 0..400 {
                file.write_all(b"chunk").await.unwrap();
                file.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let config = StabilityConfig {
            probe_interval: Duration::from_millis(25),
            max_probes: 4,
        };
        let result = wait_until_stable(&path, &config).await;
        writer.abort();
        assert!(matches!(result, Err(ImportError::Unstable { probes: 4, .. })));
    }

    #[tokio::test]
    async fn oversize_documents_are_skipped() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("huge.pdf");
        std::fs::write(&path, vec![b'x'; (BYTES_PER_MB + 1) as usize]).unwrap();

        let (tx, mut rx) = staging_queue(4);
        let importer =
            FileImporter::new(test_config(dir.path()), Arc::new(PlainTextExtractor), tx).unwrap();

        let outcome = importer.import_file(&path).await.expect("import");
        assert_eq!(
            outcome,
            ImportOutcome::Oversize {
                bytes: BYTES_PER_MB + 1,
                limit: BYTES_PER_MB
            }
        );
        drop(importer);
        assert_eq!(rx.take().await, None);
    }

    #[tokio::test]
    async fn imported_document_becomes_an_envelope() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("offer.pdf");
        std::fs::write(&path, SAMPLE_OFFER).unwrap();

        let (tx, mut rx) = staging_queue(4);
        let importer =
            FileImporter::new(test_config(dir.path()), Arc::new(PlainTextExtractor), tx).unwrap();
        importer.import_file(&path).await.expect("import");

        let envelope = RawEnvelope::from_slice(rx.take().await.unwrap().as_bytes()).unwrap();
        assert_eq!(envelope.path, path.display().to_string());
        let content: serde_json::Value = serde_json::from_str(&envelope.content).unwrap();
        assert_eq!(content["offerNumber"], "A-2024-001");
        assert_eq!(content["invoiceItems"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn watched_directory_yields_exactly_one_payload_per_document() {
        let dir = tempdir().expect("tempdir");
        let (tx, mut rx) = staging_queue(4);
        let importer =
            FileImporter::new(test_config(dir.path()), Arc::new(PlainTextExtractor), tx).unwrap();

        let token = CancellationToken::new();
        let task = tokio::spawn(importer.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        std::fs::write(dir.path().join("offer.pdf"), SAMPLE_OFFER).unwrap();
        std::fs::write(dir.path().join("readme.txt"), "not an offer").unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.take())
            .await
            .expect("payload within timeout");
        assert!(first.is_some());

        let second = tokio::time::timeout(Duration::from_millis(300), rx.take()).await;
        assert!(second.is_err(), "document must not be imported twice");

        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bus_dispatch_publishes_to_offer_input() {
        let bus = Arc::new(MemoryBus::new());
        let dispatch = OfferDispatch::Bus(QueueHandle::new(OFFER_INPUT_QUEUE, bus.clone()));
        dispatch.handle("{\"content\":\"{}\",\"path\":\"a.pdf\"}").await.unwrap();
        OfferDispatch::Logging.handle("{}").await.unwrap();

        assert_eq!(
            bus.messages_as_strings(OFFER_INPUT_QUEUE),
            ["{\"content\":\"{}\",\"path\":\"a.pdf\"}"]
        );
    }

    #[tokio::test]
    async fn processor_keeps_going_after_dispatch_failures() {
        let bus = Arc::new(MemoryBus::new());
        bus.set_rejecting(true);
        let processor =
            DocumentProcessor::new(OfferDispatch::Bus(QueueHandle::new(OFFER_INPUT_QUEUE, bus.clone())));

        let (tx, rx) = staging_queue(4);
        tx.put("lost".to_string()).await.unwrap();
        let feeder_bus = bus.clone();
        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            feeder_bus.set_rejecting(false);
            tx.put("delivered".to_string()).await.unwrap();
        });

        processor
            .run(rx, CancellationToken::new())
            .await
            .expect("processor exits when the queue closes");
        feeder.await.unwrap();
        assert_eq!(bus.messages_as_strings(OFFER_INPUT_QUEUE), ["delivered"]);
    }
}
