//! # Payment Reconciler
//!
//! Starts gateway checkouts for boosts and premium upgrades, and confirms
//! them when the gateway sends the buyer back.
//!
//! Confirmation is idempotent. Calls for one external session are
//! serialized in-process, and the store flips `pending → completed` and
//! applies the effect in a single atomic unit, so a replayed redirect or a
//! duplicate webhook reads back the completed row instead of re-applying.

use std::sync::Arc;
use std::time::Duration;

use cf_core::error::{AppError, GatewayError, Result};
use cf_core::models::{
    CheckoutMetadata, CheckoutRequest, CheckoutSession, GatewaySession, Payment,
    PaymentConfirmation, PaymentPurpose, PaymentStatus, User,
};
use cf_core::traits::{PaymentGateway, SettleOutcome, Store};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::authz::{authorize, Action};
use crate::entitlement::EntitlementService;
use crate::session::Session;
use crate::StoreResultExt;

/// Prices and redirect targets for checkouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSettings {
    /// Minor currency units.
    pub boost_price: i64,
    pub premium_price: i64,
    pub currency: String,
    /// May contain the gateway's session-id placeholder.
    pub success_url: String,
    pub cancel_url: String,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            boost_price: 100,
            premium_price: 1000,
            currency: "usd".into(),
            success_url:
                "http://localhost:8080/api/payments/success?session_id={CHECKOUT_SESSION_ID}".into(),
            cancel_url: "http://localhost:8080/api/payments/cancelled".into(),
        }
    }
}

impl PaymentSettings {
    pub fn price_of(&self, purpose: PaymentPurpose) -> i64 {
        match purpose {
            PaymentPurpose::Boost => self.boost_price,
            PaymentPurpose::Premium => self.premium_price,
        }
    }
}

pub struct PaymentReconciler {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    entitlements: EntitlementService,
    settings: PaymentSettings,
    gateway_timeout: Duration,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PaymentReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        entitlements: EntitlementService,
        settings: PaymentSettings,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            entitlements,
            settings,
            gateway_timeout,
            session_locks: DashMap::new(),
        }
    }

    pub async fn initiate_boost_checkout(
        &self,
        session: &Session,
        issue_id: Uuid,
    ) -> Result<CheckoutSession> {
        let issue = self
            .store
            .find_issue(issue_id)
            .await
            .or_unavailable("find issue")?
            .ok_or_else(|| AppError::issue_not_found(issue_id))?;
        authorize(session.user(), Action::Boost(&issue))?;
        self.entitlements.check_boost(&issue)?;

        let description = format!("Boost issue: {}", issue.title);
        self.open_checkout(session.user(), PaymentPurpose::Boost, Some(issue_id), description)
            .await
    }

    pub async fn initiate_premium_checkout(&self, session: &Session) -> Result<CheckoutSession> {
        authorize(session.user(), Action::PurchasePremium)?;
        self.entitlements.check_premium(session.user())?;
        self.open_checkout(
            session.user(),
            PaymentPurpose::Premium,
            None,
            "Premium account upgrade".into(),
        )
        .await
    }

    async fn open_checkout(
        &self,
        user: &User,
        purpose: PaymentPurpose,
        issue_id: Option<Uuid>,
        description: String,
    ) -> Result<CheckoutSession> {
        let request = CheckoutRequest {
            amount: self.settings.price_of(purpose),
            currency: self.settings.currency.clone(),
            description,
            metadata: CheckoutMetadata {
                user_id: user.id,
                purpose,
                issue_id,
            },
            success_url: self.settings.success_url.clone(),
            cancel_url: self.settings.cancel_url.clone(),
        };

        let checkout = match tokio::time::timeout(
            self.gateway_timeout,
            self.gateway.create_checkout(&request),
        )
        .await
        {
            Ok(Ok(checkout)) => checkout,
            Ok(Err(GatewayError::Rejected(reason) | GatewayError::Unavailable(reason))) => {
                tracing::error!(user_id = %user.id, %purpose, %reason, "checkout creation failed");
                return Err(AppError::Unavailable(format!("could not start checkout: {reason}")));
            }
            Err(_) => return Err(AppError::Unavailable("payment gateway timed out".into())),
        };

        let payment = Payment {
            id: Uuid::now_v7(),
            user_id: user.id,
            purpose,
            amount: request.amount,
            currency: request.currency,
            external_session_id: checkout.session_id.clone(),
            status: PaymentStatus::Pending,
            target_issue_id: issue_id,
            created_at: Utc::now(),
            completed_at: None,
        };
        if !self
            .store
            .insert_payment(payment)
            .await
            .or_unavailable("insert payment")?
        {
            return Err(AppError::Conflict(format!(
                "checkout session {} is already recorded",
                checkout.session_id
            )));
        }
        tracing::info!(
            user_id = %user.id,
            %purpose,
            session_id = %checkout.session_id,
            "checkout started"
        );
        Ok(checkout)
    }

    /// Confirms a checkout session and applies its effect at most once.
    ///
    /// # Errors
    /// `PaymentNotFound` for a session neither we nor the gateway know,
    /// `PaymentNotVerified` when the gateway says it is not paid,
    /// `Unavailable` when the gateway or the store cannot be reached.
    pub async fn confirm(&self, session_id: &str) -> Result<PaymentConfirmation> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(AppError::PaymentNotFound(String::new()));
        }

        let lock = self
            .session_locks
            .entry(session_id.to_string())
            .or_default()
            .clone();
        let outcome = {
            let _guard = lock.lock().await;
            self.confirm_serialized(session_id).await
        };
        drop(lock);
        self.session_locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
        outcome
    }

    async fn confirm_serialized(&self, session_id: &str) -> Result<PaymentConfirmation> {
        let local = self
            .store
            .find_payment_by_session(session_id)
            .await
            .or_unavailable("find payment")?;
        if let Some(payment) = local.as_ref().filter(|p| p.status == PaymentStatus::Completed) {
            tracing::debug!(session_id, "payment already confirmed");
            return Ok(confirmation_of(payment));
        }

        let remote = match (local.is_some(), self.fetch_remote(session_id).await?) {
            (_, Some(remote)) => remote,
            (false, None) => return Err(AppError::PaymentNotFound(session_id.to_string())),
            (true, None) => {
                return Err(AppError::PaymentNotVerified(format!(
                    "gateway has no record of session {session_id}"
                )))
            }
        };
        if !remote.paid {
            tracing::info!(session_id, "gateway reports session unpaid");
            return Err(AppError::PaymentNotVerified(format!(
                "session {session_id} is not paid"
            )));
        }

        match local {
            Some(payment) => check_consistent(&payment, &remote)?,
            None => {
                let adopted = self.adopt_remote(session_id, &remote).await?;
                self.store
                    .insert_payment(adopted)
                    .await
                    .or_unavailable("insert payment")?;
            }
        }

        match self
            .store
            .settle_payment(session_id)
            .await
            .or_unavailable("settle payment")?
        {
            SettleOutcome::Applied(payment) => {
                tracing::info!(
                    session_id,
                    purpose = %payment.purpose,
                    user_id = %payment.user_id,
                    "payment settled"
                );
                Ok(confirmation_of(&payment))
            }
            SettleOutcome::AlreadySettled(payment) => Ok(confirmation_of(&payment)),
            SettleOutcome::TargetMissing(payment) => {
                tracing::error!(
                    session_id,
                    purpose = %payment.purpose,
                    user_id = %payment.user_id,
                    target_issue_id = ?payment.target_issue_id,
                    "paid session has nothing left to apply to; left pending for refund"
                );
                Err(AppError::Conflict(format!(
                    "the {} paid for by session {session_id} no longer exists",
                    match payment.purpose {
                        PaymentPurpose::Boost => "issue",
                        PaymentPurpose::Premium => "account",
                    }
                )))
            }
            SettleOutcome::Missing => Err(AppError::PaymentNotFound(session_id.to_string())),
        }
    }

    async fn fetch_remote(&self, session_id: &str) -> Result<Option<GatewaySession>> {
        match tokio::time::timeout(self.gateway_timeout, self.gateway.fetch_session(session_id)).await
        {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!(session_id, "payment gateway timed out");
                Err(AppError::Unavailable("payment gateway timed out".into()))
            }
        }
    }

    /// Builds a local record for a paid session we never saw start, from the
    /// metadata attached at checkout.
    async fn adopt_remote(&self, session_id: &str, remote: &GatewaySession) -> Result<Payment> {
        let not_found = || AppError::PaymentNotFound(session_id.to_string());
        let metadata = remote.metadata.as_ref().ok_or_else(not_found)?;

        self.store
            .find_user(metadata.user_id)
            .await
            .or_unavailable("find user")?
            .ok_or_else(not_found)?;
        if metadata.purpose == PaymentPurpose::Boost {
            let issue_id = metadata.issue_id.ok_or_else(not_found)?;
            self.store
                .find_issue(issue_id)
                .await
                .or_unavailable("find issue")?
                .ok_or_else(not_found)?;
        }

        tracing::warn!(session_id, "recording paid session that had no local checkout row");
        Ok(Payment {
            id: Uuid::now_v7(),
            user_id: metadata.user_id,
            purpose: metadata.purpose,
            amount: remote
                .amount_total
                .unwrap_or_else(|| self.settings.price_of(metadata.purpose)),
            currency: self.settings.currency.clone(),
            external_session_id: session_id.to_string(),
            status: PaymentStatus::Pending,
            target_issue_id: match metadata.purpose {
                PaymentPurpose::Boost => metadata.issue_id,
                PaymentPurpose::Premium => None,
            },
            created_at: Utc::now(),
            completed_at: None,
        })
    }

    pub async fn list(&self, session: &Session) -> Result<Vec<Payment>> {
        authorize(session.user(), Action::Administer)?;
        self.store.list_payments().await.or_unavailable("list payments")
    }
}

fn check_consistent(payment: &Payment, remote: &GatewaySession) -> Result<()> {
    if remote.amount_total.is_some_and(|paid| paid < payment.amount) {
        return Err(AppError::PaymentNotVerified(format!(
            "session {} paid less than {}",
            payment.external_session_id, payment.amount
        )));
    }
    if remote
        .currency
        .as_deref()
        .is_some_and(|currency| !currency.eq_ignore_ascii_case(&payment.currency))
    {
        return Err(AppError::PaymentNotVerified(format!(
            "session {} was paid in a different currency",
            payment.external_session_id
        )));
    }
    if let Some(meta) = &remote.metadata {
        if meta.purpose != payment.purpose
            || meta.user_id != payment.user_id
            || meta.issue_id != payment.target_issue_id
        {
            return Err(AppError::PaymentNotVerified(format!(
                "session {} metadata does not match the checkout",
                payment.external_session_id
            )));
        }
    }
    Ok(())
}

fn confirmation_of(payment: &Payment) -> PaymentConfirmation {
    PaymentConfirmation {
        purpose: payment.purpose,
        target_issue_id: payment.target_issue_id,
        user_id: payment.user_id,
    }
}
