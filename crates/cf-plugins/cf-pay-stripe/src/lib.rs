//! # cf-pay-stripe
//!
//! `PaymentGateway` backed by Stripe Checkout Sessions.
//!
//! ## Error Handling
//!
//! Transport failures, timeouts, 429 and 5xx answers become
//! `GatewayError::Unavailable`; any other 4xx becomes `GatewayError::Rejected`
//! with an excerpt of the body. A 404 on lookup means the session does not
//! exist and is reported as `Ok(None)`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use cf_core::error::GatewayError;
use cf_core::models::{CheckoutMetadata, CheckoutRequest, CheckoutSession, GatewaySession};
use cf_core::traits::PaymentGateway;
use reqwest::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

pub const DEFAULT_API_BASE: &str = "https://api.stripe.com";

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub api_base: String,
    pub api_key: String,
    /// Per-request timeout (default: 10s).
    pub timeout: Duration,
}

impl StripeConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct StripeGateway {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        operation: &str,
    ) -> Result<reqwest::Response, GatewayError> {
        let resp = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Unavailable(format!("{operation}: timed out"))
                } else {
                    GatewayError::Unavailable(format!("{operation}: {e}"))
                }
            })?;

        let status = resp.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::Unavailable(format!("{operation}: HTTP {status}")));
        }
        Ok(resp)
    }
}

async fn rejected(resp: reqwest::Response, operation: &str) -> GatewayError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(200).collect();
    tracing::warn!(%status, operation, body = %excerpt, "stripe refused request");
    GatewayError::Rejected(format!("{operation}: HTTP {status}: {excerpt}"))
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        let url = format!("{}/v1/checkout/sessions", self.api_base);
        let resp = self
            .send(
                self.client.post(url).form(&checkout_form(request)),
                "create checkout session",
            )
            .await?;
        if !resp.status().is_success() {
            return Err(rejected(resp, "create checkout session").await);
        }

        let dto: SessionDto = resp
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("malformed checkout session: {e}")))?;
        let url = dto
            .url
            .ok_or_else(|| GatewayError::Rejected("checkout session has no redirect url".into()))?;
        Ok(CheckoutSession {
            session_id: dto.id,
            url,
        })
    }

    async fn fetch_session(&self, session_id: &str) -> Result<Option<GatewaySession>, GatewayError> {
        if !is_session_id(session_id) {
            return Ok(None);
        }
        let url = format!("{}/v1/checkout/sessions/{session_id}", self.api_base);
        let resp = self.send(self.client.get(url), "retrieve checkout session").await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(rejected(resp, "retrieve checkout session").await);
        }

        let dto: SessionDto = resp
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("malformed checkout session: {e}")))?;
        Ok(Some(dto.into_gateway_session()))
    }
}

/// Stripe session ids are `cs_live_...` / `cs_test_...`; anything else
/// cannot name a session and must not reach the URL path.
fn is_session_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Form body for `POST /v1/checkout/sessions`.
fn checkout_form(request: &CheckoutRequest) -> Vec<(&'static str, String)> {
    let meta = &request.metadata;
    let mut form = vec![
        ("mode", "payment".to_string()),
        ("success_url", request.success_url.clone()),
        ("cancel_url", request.cancel_url.clone()),
        ("line_items[0][quantity]", "1".to_string()),
        ("line_items[0][price_data][currency]", request.currency.clone()),
        ("line_items[0][price_data][unit_amount]", request.amount.to_string()),
        ("line_items[0][price_data][product_data][name]", request.description.clone()),
        ("metadata[user_id]", meta.user_id.to_string()),
        ("metadata[purpose]", meta.purpose.to_string()),
    ];
    if let Some(issue_id) = meta.issue_id {
        form.push(("metadata[issue_id]", issue_id.to_string()));
    }
    form
}

#[derive(Debug, Deserialize)]
struct SessionDto {
    id: String,
    url: Option<String>,
    payment_status: Option<String>,
    amount_total: Option<i64>,
    currency: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl SessionDto {
    fn into_gateway_session(self) -> GatewaySession {
        let metadata = parse_metadata(&self.metadata);
        if metadata.is_none() && !self.metadata.is_empty() {
            tracing::warn!(session_id = %self.id, "checkout session carries unreadable metadata");
        }
        GatewaySession {
            paid: self.payment_status.as_deref() == Some("paid"),
            amount_total: self.amount_total,
            currency: self.currency.map(|c| c.to_lowercase()),
            metadata,
            session_id: self.id,
        }
    }
}

fn parse_metadata(raw: &HashMap<String, String>) -> Option<CheckoutMetadata> {
    let user_id = raw.get("user_id")?.parse::<Uuid>().ok()?;
    let purpose = raw.get("purpose")?.parse().ok()?;
    let issue_id = match raw.get("issue_id") {
        Some(id) => Some(id.parse::<Uuid>().ok()?),
        None => None,
    };
    Some(CheckoutMetadata {
        user_id,
        purpose,
        issue_id,
    })
}
