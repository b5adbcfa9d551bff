//! JSON API over stored customers, offers and invoices (`/api/v1`).

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use offerflow_core::{CustomerDetails, Invoice, InvoiceItem};
use offerflow_db::{NewInvoice, Repository, RepositoryError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const CRATE_NAME: &str = "offerflow-web";

#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn Repository>,
}

impl AppState {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }
}

/// Body of `POST /invoice`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceRequest {
    #[serde(default)]
    pub offer_id: Option<String>,
    pub invoice_number: String,
    pub invoice_date: NaiveDate,
    pub invoice_total_sum: Decimal,
    pub customer: CustomerDetails,
    #[serde(default)]
    pub invoice_items: Vec<InvoiceItem>,
}

impl From<InvoiceRequest> for NewInvoice {
    fn from(request: InvoiceRequest) -> Self {
        Self {
            offer_number: request.offer_id.filter(|id| !id.trim().is_empty()),
            invoice_number: request.invoice_number,
            invoice_date: request.invoice_date,
            invoice_total_sum: request.invoice_total_sum,
            customer: request.customer,
            items: request.invoice_items,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceView {
    pub invoice_id: i64,
    pub invoice_number: String,
    pub invoice_date: NaiveDate,
    pub invoice_total_sum: Decimal,
    pub is_checked: Option<DateTime<Utc>>,
    pub is_valid: bool,
    pub customer: Option<CustomerDetails>,
    pub invoice_items: Vec<InvoiceItem>,
    pub offer_id: Option<String>,
}

impl InvoiceView {
    fn new(invoice: Invoice, customer: Option<CustomerDetails>) -> Self {
        Self {
            invoice_id: invoice.id,
            invoice_number: invoice.invoice_number,
            invoice_date: invoice.invoice_date,
            invoice_total_sum: invoice.invoice_total_sum,
            is_checked: invoice.is_checked,
            is_valid: invoice.is_valid,
            customer,
            invoice_items: invoice.items,
            offer_id: invoice.offer_number,
        }
    }
}

pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .route("/customer", get(customers_handler))
        .route("/customer/{customer_id}", get(customer_handler))
        .route("/offer", get(offers_handler))
        .route("/offer/{customer_id}", get(customer_offers_handler))
        .route("/invoice", post(create_invoice_handler))
        .route("/invoice/{offer_id}", get(invoice_handler));
    Router::new()
        .nest("/api/v1", api)
        .with_state(Arc::new(state))
}

/// Serve until `token` is cancelled, then drain in-flight requests.
pub async fn serve(state: AppState, port: u16, token: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "rest api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    info!("rest api stopped");
    Ok(())
}

async fn customers_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.repository.list_customers().await {
        Ok(customers) => Json(customers).into_response(),
        Err(err) => server_error(err),
    }
}

async fn customer_handler(
    State(state): State<Arc<AppState>>,
    Path(customer_id): Path<i64>,
) -> Response {
    match state.repository.find_customer(customer_id).await {
        Ok(Some(customer)) => Json(customer).into_response(),
        Ok(None) => not_found(format!("customer {customer_id} not found")),
        Err(err) => server_error(err),
    }
}

async fn offers_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.repository.list_offers().await {
        Ok(offers) => Json(offers).into_response(),
        Err(err) => server_error(err),
    }
}

async fn customer_offers_handler(
    State(state): State<Arc<AppState>>,
    Path(customer_id): Path<i64>,
) -> Response {
    match state.repository.offers_for_customer(customer_id).await {
        Ok(offers) if offers.is_empty() => {
            not_found(format!("no offers for customer {customer_id}"))
        }
        Ok(offers) => Json(offers).into_response(),
        Err(err) => server_error(err),
    }
}

async fn invoice_handler(
    State(state): State<Arc<AppState>>,
    Path(offer_id): Path<String>,
) -> Response {
    let invoice = match state.repository.invoice_for_offer(&offer_id).await {
        Ok(Some(invoice)) => invoice,
        Ok(None) => {
            info!(offer_id = %offer_id, "no invoice for offer");
            return not_found(format!("no invoice for offer {offer_id}"));
        }
        Err(err) => return server_error(err),
    };
    match state.repository.find_customer(invoice.customer_id).await {
        Ok(customer) => {
            Json(InvoiceView::new(invoice, customer.map(|c| c.details))).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn create_invoice_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<InvoiceRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    match state.repository.create_invoice(&request.into()).await {
        Ok(id) => Json(id).into_response(),
        Err(RepositoryError::Invalid(reason)) => bad_request(reason),
        Err(err) => server_error(err),
    }
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: RepositoryError) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("server error: {err}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use offerflow_core::LineItem;
    use offerflow_db::{MemoryRepository, NewOffer};
    use serde_json::Value;
    use tower::ServiceExt;

    fn details(company: &str) -> CustomerDetails {
        CustomerDetails {
            company_name: company.into(),
            address_street: "Lange Straße".into(),
            address_house_number: "12".into(),
            city: "Rosenheim".into(),
            ..CustomerDetails::default()
        }
    }

    async fn seeded() -> Arc<MemoryRepository> {
        let repository = Arc::new(MemoryRepository::new());
        repository
            .record_offer(
                &details("Muster GmbH"),
                &NewOffer {
                    offer_number: "A-1".into(),
                    offer_date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
                    offer_valid_till: NaiveDate::from_ymd_opt(2024, 4, 5),
                    offer_value: Decimal::new(25000, 2),
                    items: vec![LineItem {
                        pos_number: 1,
                        description: "Beratung".into(),
                        amount: 2,
                        price: Decimal::new(12500, 2),
                    }],
                },
            )
            .await
            .unwrap();
        repository
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn post_invoice(app: Router, body: Value) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/invoice")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    fn invoice_body(offer_id: &str, total: &str, items: Value) -> Value {
        json!({
            "offerId": offer_id,
            "invoiceNumber": "R-2024-7",
            "invoiceDate": "2024-04-01",
            "invoiceTotalSum": total,
            "customer": { "companyName": "Muster GmbH", "addressStreet": "Lange Straße" },
            "invoiceItems": items
        })
    }

    #[tokio::test]
    async fn customers_are_listed_and_looked_up() {
        let app = app(AppState::new(seeded().await));

        let (status, body) = get_json(app.clone(), "/api/v1/customer").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["companyName"], "Muster GmbH");
        let id = body[0]["id"].as_i64().unwrap();

        let (status, body) = get_json(app.clone(), &format!("/api/v1/customer/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["addressHouseNumber"], "12");

        let (status, _) = get_json(app, "/api/v1/customer/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn offers_are_listed_per_customer() {
        let app = app(AppState::new(seeded().await));

        let (status, body) = get_json(app.clone(), "/api/v1/offer").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["offerNumber"], "A-1");
        assert_eq!(body[0]["items"][0]["posNumber"], 1);

        let (status, body) = get_json(app.clone(), "/api/v1/offer/1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = get_json(app, "/api/v1/offer/42").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn submitted_invoice_is_pending_and_linked() {
        let repository = seeded().await;
        let app = app(AppState::new(repository.clone()));

        let items = json!([{ "posNumber": 1, "description": "Beratung", "amount": 2, "price": "125.00" }]);
        let (status, body) = post_invoice(app.clone(), invoice_body("A-1", "250.00", items)).await;
        assert_eq!(status, StatusCode::OK);
        let id = body.as_i64().unwrap();

        let stored = repository.find_invoice(id).await.unwrap().unwrap();
        assert!(stored.is_pending());
        assert!(!stored.is_valid);
        assert_eq!(repository.list_customers().await.unwrap().len(), 1);

        let (status, body) = get_json(app.clone(), "/api/v1/invoice/A-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["invoiceId"], id);
        assert_eq!(body["offerId"], "A-1");
        assert_eq!(body["isChecked"], Value::Null);
        assert_eq!(body["customer"]["companyName"], "Muster GmbH");

        let (status, _) = get_json(app, "/api/v1/invoice/A-404").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_invoices_are_rejected() {
        let app = app(AppState::new(seeded().await));
        let items = json!([{ "posNumber": 1, "description": "Beratung", "amount": 2, "price": "125.00" }]);

        let (status, _) = post_invoice(app.clone(), invoice_body("A-1", "250.00", json!([]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post_invoice(app.clone(), invoice_body("A-1", "0", items.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post_invoice(app, json!({ "invoiceNumber": "R-1" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
