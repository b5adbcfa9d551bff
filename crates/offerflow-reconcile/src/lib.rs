//! Invoice reconciliation: a periodic job that asks an external completion
//! service whether each pending invoice matches its offer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use offerflow_core::{
    env_optional, env_required, process_env, BackoffPolicy, ConfigError, EnvLookup, Invoice, Offer,
};
use offerflow_db::{Repository, RepositoryError};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "offerflow-reconcile";

pub const DEFAULT_AI_BASE_URL: &str = "https://inference.ai.cnds.io/v1";
pub const DEFAULT_AI_MODEL: &str = "artllama-chat-medium";

#[derive(Clone)]
pub struct CompletionConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl fmt::Debug for CompletionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CompletionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: env_optional(lookup, "AI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_AI_BASE_URL.to_string()),
            api_key: env_required(lookup, "AI_API_KEY")?,
            model: env_optional(lookup, "AI_MODEL").unwrap_or_else(|| DEFAULT_AI_MODEL.to_string()),
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("completion service answered {status}: {body}")]
    HttpStatus { status: u16, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// OpenAI-compatible chat completion client.
#[derive(Debug, Clone)]
pub struct ChatCompletionClient {
    client: reqwest::Client,
    config: CompletionConfig,
}

impl ChatCompletionClient {
    pub fn new(config: CompletionConfig) -> Result<Self, CompletionError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl CompletionBackend for ChatCompletionClient {
    /// Returns the concatenated content of every choice.
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        let url = self.config.completions_url();
        let body = ChatRequest {
            model: &self.config.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let max_retries = self.config.backoff.max_retries;

        let mut attempt = 0;
        loop {
            match self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    let parsed: ChatResponse = resp.json().await?;
                    return Ok(parsed
                        .choices
                        .into_iter()
                        .filter_map(|choice| choice.message.content)
                        .collect());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= max_retries
                    {
                        return Err(CompletionError::HttpStatus {
                            status: status.as_u16(),
                            body: text,
                        });
                    }
                    warn!(status = status.as_u16(), attempt, "completion service error; retrying");
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= max_retries
                    {
                        return Err(err.into());
                    }
                    warn!(error = %err, attempt, "completion request failed; retrying");
                }
            }
            tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

/// Decides whether an invoice matches its offer.
pub struct ComparisonDelegate {
    backend: Arc<dyn CompletionBackend>,
}

impl ComparisonDelegate {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }

    pub fn build_prompt(offer: &Offer, invoice: &Invoice) -> String {
        format!(
            "Compare the given offer with the corresponding invoice.\n\
             Check if {} = {}, {} = {}, {} = {} & {} = {}\n\
             Only return 'true' when their contents match.\n\
             \n\
             Please only answer with \"true\" or \"false\".\n",
            offer.offer_number,
            invoice.offer_number.as_deref().unwrap_or_default(),
            offer.offer_date,
            invoice.invoice_date,
            offer.offer_value,
            invoice.invoice_total_sum,
            offer.customer_id,
            invoice.customer_id,
        )
    }

    /// Exactly `true` (after trimming) is a match. Anything else, including
    /// a failed call, is not.
    pub async fn compare(&self, offer: &Offer, invoice: &Invoice) -> bool {
        if offer.offer_number.trim().is_empty() || invoice.invoice_number.trim().is_empty() {
            warn!(
                offer_number = %offer.offer_number,
                invoice_id = invoice.id,
                "offer or invoice lacks identifying fields; treated as mismatch"
            );
            return false;
        }

        let prompt = Self::build_prompt(offer, invoice);
        match self.backend.complete(&prompt).await {
            Ok(answer) => {
                debug!(invoice_id = invoice.id, answer = %answer, "comparison answered");
                answer.trim() == "true"
            }
            Err(err) => {
                warn!(
                    invoice_id = invoice.id,
                    offer_number = %offer.offer_number,
                    error = %err,
                    "comparison failed; treated as mismatch"
                );
                false
            }
        }
    }
}

/// Periodic job pairing pending invoices with their offers.
pub struct ReconciliationScheduler {
    repository: Arc<dyn Repository>,
    delegate: Arc<ComparisonDelegate>,
    interval: Duration,
}

impl ReconciliationScheduler {
    pub fn new(
        repository: Arc<dyn Repository>,
        delegate: Arc<ComparisonDelegate>,
        interval: Duration,
    ) -> Self {
        Self {
            repository,
            delegate,
            interval,
        }
    }

    /// Start one comparison task per pending invoice that has an offer.
    /// The returned handles resolve once each result has been recorded.
    pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>, RepositoryError> {
        let pending = self.repository.pending_invoices().await?;
        let mut tasks = Vec::new();

        for invoice in pending {
            let Some(offer_number) = invoice.offer_number.as_deref() else {
                continue;
            };
            let offer = match self.repository.find_offer(offer_number).await {
                Ok(Some(offer)) => offer,
                Ok(None) => {
                    info!(invoice_id = invoice.id, offer_number, "no offer found for invoice");
                    continue;
                }
                Err(err) => {
                    warn!(
                        invoice_id = invoice.id,
                        offer_number,
                        error = %err,
                        "loading offer for invoice failed"
                    );
                    continue;
                }
            };

            let repository = Arc::clone(&self.repository);
            let delegate = Arc::clone(&self.delegate);
            tasks.push(tokio::spawn(async move {
                let matched = delegate.compare(&offer, &invoice).await;
                match repository
                    .record_comparison(invoice.id, matched, Utc::now())
                    .await
                {
                    Ok(true) => info!(
                        invoice_id = invoice.id,
                        offer_number = %offer.offer_number,
                        valid = matched,
                        "invoice compared with offer"
                    ),
                    Ok(false) => debug!(invoice_id = invoice.id, "invoice was already checked"),
                    Err(err) => error!(
                        invoice_id = invoice.id,
                        error = %err,
                        "recording comparison result failed"
                    ),
                }
            }));
        }

        Ok(tasks)
    }

    async fn tick_logged(&self) {
        info!("matching job started");
        match self.tick().await {
            Ok(tasks) => info!(comparisons = tasks.len(), "matching job dispatched"),
            Err(err) => error!(error = %err, "matching job failed"),
        }
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
        let mut sched = JobScheduler::new().await.context("creating scheduler")?;
        let job_self = Arc::clone(&self);
        let job = Job::new_repeated_async(self.interval, move |_uuid, _l| {
            let this = Arc::clone(&job_self);
            Box::pin(async move {
                this.tick_logged().await;
            })
        })
        .context("creating matching job")?;
        sched.add(job).await.context("adding matching job")?;

        self.tick_logged().await;
        sched.start().await.context("starting scheduler")?;
        info!(interval_secs = self.interval.as_secs(), "reconciliation scheduler running");

        token.cancelled().await;
        sched.shutdown().await.context("stopping scheduler")?;
        info!("reconciliation scheduler stopped");
        Ok(())
    }
}
