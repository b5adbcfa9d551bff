//! Relational store for customers, offers and invoices.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use offerflow_core::{
    ensure_unique_positions, env_parse_or, env_required, process_env, ConfigError, Customer,
    CustomerDetails, EnvLookup, Invoice, InvoiceItem, LineItem, Offer, OfferItem,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "offerflow-db";

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_required(lookup, "DATABASE_URL")?,
            max_connections: env_parse_or(lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
            acquire_timeout: Duration::from_secs(10),
        })
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("offer {0} already exists")]
    DuplicateOffer(String),
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// An offer as it arrives from the normalizer, before its customer is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOffer {
    pub offer_number: String,
    pub offer_date: NaiveDate,
    pub offer_valid_till: Option<NaiveDate>,
    pub offer_value: Decimal,
    pub items: Vec<OfferItem>,
}

impl NewOffer {
    pub fn validate(&self) -> Result<(), RepositoryError> {
        if self.offer_number.trim().is_empty() {
            return Err(RepositoryError::Invalid("offer number is empty".into()));
        }
        validate_items(&self.items)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInvoice {
    /// Linked only when an offer with this number exists.
    pub offer_number: Option<String>,
    pub invoice_number: String,
    pub invoice_date: NaiveDate,
    pub invoice_total_sum: Decimal,
    pub customer: CustomerDetails,
    pub items: Vec<InvoiceItem>,
}

impl NewInvoice {
    pub fn validate(&self) -> Result<(), RepositoryError> {
        if self.items.is_empty() {
            return Err(RepositoryError::Invalid(
                "an invoice needs at least one item".into(),
            ));
        }
        if self.invoice_total_sum <= Decimal::ZERO {
            return Err(RepositoryError::Invalid(format!(
                "invoice total {} must be positive",
                self.invoice_total_sum
            )));
        }
        validate_items(&self.items)
    }
}

fn validate_items(items: &[LineItem]) -> Result<(), RepositoryError> {
    for item in items {
        item.validate().map_err(RepositoryError::Invalid)?;
    }
    ensure_unique_positions(items).map_err(RepositoryError::Invalid)
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Find or create the customer and insert the offer with its items,
    /// all in one transaction.
    async fn record_offer(
        &self,
        customer: &CustomerDetails,
        offer: &NewOffer,
    ) -> Result<(Customer, Offer), RepositoryError>;

    async fn list_customers(&self) -> Result<Vec<Customer>, RepositoryError>;

    async fn find_customer(&self, id: i64) -> Result<Option<Customer>, RepositoryError>;

    async fn list_offers(&self) -> Result<Vec<Offer>, RepositoryError>;

    async fn find_offer(&self, offer_number: &str) -> Result<Option<Offer>, RepositoryError>;

    async fn offers_for_customer(&self, customer_id: i64) -> Result<Vec<Offer>, RepositoryError>;

    /// Returns the new invoice id. The invoice starts pending and invalid.
    async fn create_invoice(&self, invoice: &NewInvoice) -> Result<i64, RepositoryError>;

    async fn find_invoice(&self, id: i64) -> Result<Option<Invoice>, RepositoryError>;

    /// Most recent invoice referencing the offer.
    async fn invoice_for_offer(&self, offer_number: &str)
        -> Result<Option<Invoice>, RepositoryError>;

    async fn pending_invoices(&self) -> Result<Vec<Invoice>, RepositoryError>;

    /// Store a comparison result. `is_checked` is only set on a match, and
    /// only invoices that are still pending are touched. Returns whether a
    /// row changed.
    async fn record_comparison(
        &self,
        invoice_id: i64,
        matched: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;
        info!(max_connections = config.max_connections, "database pool ready");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    async fn load_offer_items(
        &self,
        offer_numbers: Vec<String>,
    ) -> Result<HashMap<String, Vec<OfferItem>>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT offer_number, pos_number, description, amount, price
            FROM offer_item
            WHERE offer_number = ANY($1)
            ORDER BY offer_number, pos_number
            "#,
        )
        .bind(offer_numbers)
        .fetch_all(&self.pool)
        .await?;

        let mut items: HashMap<String, Vec<OfferItem>> = HashMap::new();
        for row in rows {
            let offer_number: String = row.try_get("offer_number")?;
            items.entry(offer_number).or_default().push(item_from_row(&row)?);
        }
        Ok(items)
    }

    async fn offers_with_items(&self, rows: Vec<PgRow>) -> Result<Vec<Offer>, RepositoryError> {
        let mut offers = rows
            .iter()
            .map(offer_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let numbers = offers.iter().map(|o| o.offer_number.clone()).collect();
        let mut items = self.load_offer_items(numbers).await?;
        for offer in &mut offers {
            offer.items = items.remove(&offer.offer_number).unwrap_or_default();
        }
        Ok(offers)
    }

    async fn invoices_with_items(&self, rows: Vec<PgRow>) -> Result<Vec<Invoice>, RepositoryError> {
        let mut invoices = rows
            .iter()
            .map(invoice_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        if invoices.is_empty() {
            return Ok(invoices);
        }
        let ids: Vec<i64> = invoices.iter().map(|i| i.id).collect();
        let rows = sqlx::query(
            r#"
            SELECT invoice_id, pos_number, description, amount, price
            FROM invoice_item
            WHERE invoice_id = ANY($1)
            ORDER BY invoice_id, pos_number
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut items: HashMap<i64, Vec<InvoiceItem>> = HashMap::new();
        for row in rows {
            let invoice_id: i64 = row.try_get("invoice_id")?;
            items.entry(invoice_id).or_default().push(item_from_row(&row)?);
        }
        for invoice in &mut invoices {
            invoice.items = items.remove(&invoice.id).unwrap_or_default();
        }
        Ok(invoices)
    }
}

const CUSTOMER_COLUMNS: &str =
    "id, company_name, address_street, address_house_number, post_code, city, phone, mail";
const OFFER_COLUMNS: &str = "offer_number, offer_date, offer_valid_till, offer_value, customer_id";
const INVOICE_COLUMNS: &str = "id, invoice_number, invoice_date, invoice_total_sum, is_checked, is_valid, offer_number, customer_id";

fn customer_from_row(row: &PgRow) -> Result<Customer, sqlx::Error> {
    Ok(Customer {
        id: row.try_get("id")?,
        details: CustomerDetails {
            company_name: row.try_get("company_name")?,
            address_street: row.try_get("address_street")?,
            address_house_number: row.try_get("address_house_number")?,
            post_code: row.try_get("post_code")?,
            city: row.try_get("city")?,
            phone: row.try_get("phone")?,
            mail: row.try_get("mail")?,
        },
    })
}

fn offer_from_row(row: &PgRow) -> Result<Offer, sqlx::Error> {
    Ok(Offer {
        offer_number: row.try_get("offer_number")?,
        offer_date: row.try_get("offer_date")?,
        offer_valid_till: row.try_get("offer_valid_till")?,
        offer_value: row.try_get("offer_value")?,
        customer_id: row.try_get("customer_id")?,
        items: Vec::new(),
    })
}

fn invoice_from_row(row: &PgRow) -> Result<Invoice, sqlx::Error> {
    Ok(Invoice {
        id: row.try_get("id")?,
        invoice_number: row.try_get("invoice_number")?,
        invoice_date: row.try_get("invoice_date")?,
        invoice_total_sum: row.try_get("invoice_total_sum")?,
        is_checked: row.try_get("is_checked")?,
        is_valid: row.try_get("is_valid")?,
        offer_number: row.try_get("offer_number")?,
        customer_id: row.try_get("customer_id")?,
        items: Vec::new(),
    })
}

fn item_from_row(row: &PgRow) -> Result<LineItem, sqlx::Error> {
    Ok(LineItem {
        pos_number: row.try_get("pos_number")?,
        description: row.try_get("description")?,
        amount: row.try_get("amount")?,
        price: row.try_get("price")?,
    })
}

/// Insert-if-absent on `(company_name, address_street)`, then read back.
/// An existing customer keeps its stored contact details.
async fn find_or_create_customer(
    conn: &mut PgConnection,
    details: &CustomerDetails,
) -> Result<Customer, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO customer
            (company_name, address_street, address_house_number, post_code, city, phone, mail)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT ON CONSTRAINT customer_identity_key DO NOTHING
        "#,
    )
    .bind(&details.company_name)
    .bind(&details.address_street)
    .bind(&details.address_house_number)
    .bind(&details.post_code)
    .bind(&details.city)
    .bind(&details.phone)
    .bind(&details.mail)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query(&format!(
        "SELECT {CUSTOMER_COLUMNS} FROM customer WHERE company_name = $1 AND address_street = $2"
    ))
    .bind(&details.company_name)
    .bind(&details.address_street)
    .fetch_one(&mut *conn)
    .await?;
    customer_from_row(&row)
}

#[async_trait]
impl Repository for PgRepository {
    async fn record_offer(
        &self,
        customer: &CustomerDetails,
        offer: &NewOffer,
    ) -> Result<(Customer, Offer), RepositoryError> {
        offer.validate()?;
        let mut tx = self.pool.begin().await?;

        let customer = find_or_create_customer(&mut *tx, customer).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO offer (offer_number, offer_date, offer_valid_till, offer_value, customer_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (offer_number) DO NOTHING
            "#,
        )
        .bind(&offer.offer_number)
        .bind(offer.offer_date)
        .bind(offer.offer_valid_till)
        .bind(offer.offer_value)
        .bind(customer.id)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RepositoryError::DuplicateOffer(offer.offer_number.clone()));
        }

        for item in &offer.items {
            sqlx::query(
                r#"
                INSERT INTO offer_item (offer_number, pos_number, description, amount, price)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&offer.offer_number)
            .bind(item.pos_number)
            .bind(&item.description)
            .bind(item.amount)
            .bind(item.price)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(offer_number = %offer.offer_number, customer_id = customer.id, "offer stored");

        let stored = Offer {
            offer_number: offer.offer_number.clone(),
            offer_date: offer.offer_date,
            offer_valid_till: offer.offer_valid_till,
            offer_value: offer.offer_value,
            customer_id: customer.id,
            items: offer.items.clone(),
        };
        Ok((customer, stored))
    }

    async fn list_customers(&self) -> Result<Vec<Customer>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {CUSTOMER_COLUMNS} FROM customer ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(customer_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn find_customer(&self, id: i64) -> Result<Option<Customer>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {CUSTOMER_COLUMNS} FROM customer WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(customer_from_row).transpose()?)
    }

    async fn list_offers(&self) -> Result<Vec<Offer>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {OFFER_COLUMNS} FROM offer ORDER BY offer_date, offer_number"
        ))
        .fetch_all(&self.pool)
        .await?;
        self.offers_with_items(rows).await
    }

    async fn find_offer(&self, offer_number: &str) -> Result<Option<Offer>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {OFFER_COLUMNS} FROM offer WHERE offer_number = $1"
        ))
        .bind(offer_number)
        .fetch_all(&self.pool)
        .await?;
        Ok(self.offers_with_items(rows).await?.into_iter().next())
    }

    async fn offers_for_customer(&self, customer_id: i64) -> Result<Vec<Offer>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {OFFER_COLUMNS} FROM offer WHERE customer_id = $1 ORDER BY offer_date, offer_number"
        ))
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        self.offers_with_items(rows).await
    }

    async fn create_invoice(&self, invoice: &NewInvoice) -> Result<i64, RepositoryError> {
        invoice.validate()?;
        let mut tx = self.pool.begin().await?;

        let customer = find_or_create_customer(&mut *tx, &invoice.customer).await?;

        let linked_offer: Option<String> = match &invoice.offer_number {
            Some(number) => sqlx::query("SELECT offer_number FROM offer WHERE offer_number = $1")
                .bind(number)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.try_get("offer_number"))
                .transpose()?,
            None => None,
        };

        let row = sqlx::query(
            r#"
            INSERT INTO invoice
                (invoice_number, invoice_date, invoice_total_sum, is_checked, is_valid, offer_number, customer_id)
            VALUES ($1, $2, $3, NULL, FALSE, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&invoice.invoice_number)
        .bind(invoice.invoice_date)
        .bind(invoice.invoice_total_sum)
        .bind(&linked_offer)
        .bind(customer.id)
        .fetch_one(&mut *tx)
        .await?;
        let id: i64 = row.try_get("id")?;

        for item in &invoice.items {
            sqlx::query(
                r#"
                INSERT INTO invoice_item (invoice_id, pos_number, description, amount, price)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(id)
            .bind(item.pos_number)
            .bind(&item.description)
            .bind(item.amount)
            .bind(item.price)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            invoice_id = id,
            invoice_number = %invoice.invoice_number,
            offer_number = linked_offer.as_deref().unwrap_or("-"),
            "invoice stored"
        );
        Ok(id)
    }

    async fn find_invoice(&self, id: i64) -> Result<Option<Invoice>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {INVOICE_COLUMNS} FROM invoice WHERE id = $1"))
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        Ok(self.invoices_with_items(rows).await?.into_iter().next())
    }

    async fn invoice_for_offer(
        &self,
        offer_number: &str,
    ) -> Result<Option<Invoice>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoice WHERE offer_number = $1 ORDER BY id DESC LIMIT 1"
        ))
        .bind(offer_number)
        .fetch_all(&self.pool)
        .await?;
        Ok(self.invoices_with_items(rows).await?.into_iter().next())
    }

    async fn pending_invoices(&self) -> Result<Vec<Invoice>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoice WHERE is_checked IS NULL ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        self.invoices_with_items(rows).await
    }

    async fn record_comparison(
        &self,
        invoice_id: i64,
        matched: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE invoice
            SET is_valid = $2::boolean,
                is_checked = CASE WHEN $2::boolean THEN $3::timestamptz ELSE NULL END
            WHERE id = $1 AND is_checked IS NULL
            "#,
        )
        .bind(invoice_id)
        .bind(matched)
        .bind(checked_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    customers: Vec<Customer>,
    offers: BTreeMap<String, Offer>,
    invoices: Vec<Invoice>,
}

impl MemoryState {
    fn find_or_create_customer(&mut self, details: &CustomerDetails) -> Customer {
        if let Some(existing) = self
            .customers
            .iter()
            .find(|c| c.details.identity() == details.identity())
        {
            return existing.clone();
        }
        let customer = Customer {
            id: self.customers.len() as i64 + 1,
            details: details.clone(),
        };
        self.customers.push(customer.clone());
        customer
    }
}

/// Process-local repository with the same semantics as [`PgRepository`].
/// Every operation runs under one lock.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn record_offer(
        &self,
        customer: &CustomerDetails,
        offer: &NewOffer,
    ) -> Result<(Customer, Offer), RepositoryError> {
        offer.validate()?;
        let mut state = self.lock();
        if state.offers.contains_key(&offer.offer_number) {
            return Err(RepositoryError::DuplicateOffer(offer.offer_number.clone()));
        }
        let customer = state.find_or_create_customer(customer);
        let stored = Offer {
            offer_number: offer.offer_number.clone(),
            offer_date: offer.offer_date,
            offer_valid_till: offer.offer_valid_till,
            offer_value: offer.offer_value,
            customer_id: customer.id,
            items: offer.items.clone(),
        };
        state
            .offers
            .insert(stored.offer_number.clone(), stored.clone());
        Ok((customer, stored))
    }

    async fn list_customers(&self) -> Result<Vec<Customer>, RepositoryError> {
        Ok(self.lock().customers.clone())
    }

    async fn find_customer(&self, id: i64) -> Result<Option<Customer>, RepositoryError> {
        Ok(self.lock().customers.iter().find(|c| c.id == id).cloned())
    }

    async fn list_offers(&self) -> Result<Vec<Offer>, RepositoryError> {
        let mut offers: Vec<Offer> = self.lock().offers.values().cloned().collect();
        offers.sort_by(|a, b| {
            (a.offer_date, &a.offer_number).cmp(&(b.offer_date, &b.offer_number))
        });
        Ok(offers)
    }

    async fn find_offer(&self, offer_number: &str) -> Result<Option<Offer>, RepositoryError> {
        Ok(self.lock().offers.get(offer_number).cloned())
    }

    async fn offers_for_customer(&self, customer_id: i64) -> Result<Vec<Offer>, RepositoryError> {
        Ok(self
            .list_offers()
            .await?
            .into_iter()
            .filter(|o| o.customer_id == customer_id)
            .collect())
    }

    async fn create_invoice(&self, invoice: &NewInvoice) -> Result<i64, RepositoryError> {
        invoice.validate()?;
        let mut state = self.lock();
        let customer = state.find_or_create_customer(&invoice.customer);
        let offer_number = invoice
            .offer_number
            .as_ref()
            .filter(|number| state.offers.contains_key(number.as_str()))
            .cloned();
        let id = state.invoices.len() as i64 + 1;
        state.invoices.push(Invoice {
            id,
            invoice_number: invoice.invoice_number.clone(),
            invoice_date: invoice.invoice_date,
            invoice_total_sum: invoice.invoice_total_sum,
            is_checked: None,
            is_valid: false,
            offer_number,
            customer_id: customer.id,
            items: invoice.items.clone(),
        });
        Ok(id)
    }

    async fn find_invoice(&self, id: i64) -> Result<Option<Invoice>, RepositoryError> {
        Ok(self.lock().invoices.iter().find(|i| i.id == id).cloned())
    }

    async fn invoice_for_offer(
        &self,
        offer_number: &str,
    ) -> Result<Option<Invoice>, RepositoryError> {
        Ok(self
            .lock()
            .invoices
            .iter()
            .rev()
            .find(|i| i.offer_number.as_deref() == Some(offer_number))
            .cloned())
    }

    async fn pending_invoices(&self) -> Result<Vec<Invoice>, RepositoryError> {
        Ok(self
            .lock()
            .invoices
            .iter()
            .filter(|i| i.is_pending())
            .cloned()
            .collect())
    }

    async fn record_comparison(
        &self,
        invoice_id: i64,
        matched: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.lock();
        let Some(invoice) = state
            .invoices
            .iter_mut()
            .find(|i| i.id == invoice_id && i.is_pending())
        else {
            return Ok(false);
        };
        invoice.is_valid = matched;
        invoice.is_checked = matched.then_some(checked_at);
        Ok(true)
    }
}
