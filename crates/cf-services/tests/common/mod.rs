//! Shared fixtures: an engine over the in-memory store, an identity
//! verifier that trusts the token as the subject, and a scriptable gateway.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cf_core::error::{GatewayError, IdentityError};
use cf_core::models::{
    CheckoutRequest, CheckoutSession, GatewaySession, IdentityClaims, Issue, IssuePayload, Role,
    User,
};
use cf_core::traits::{IdentityVerifier, PaymentGateway, UserRepo};
use cf_db_memory::MemoryStore;
use cf_services::{Engine, EngineSettings, Session};
use dashmap::DashMap;

/// Accepts any token of the form `<subject>` except `bad`.
pub struct TrustingIdentity;

#[async_trait]
impl IdentityVerifier for TrustingIdentity {
    async fn verify(&self, token: &str) -> Result<IdentityClaims, IdentityError> {
        if token == "bad" {
            return Err(IdentityError::Invalid("signature mismatch".into()));
        }
        Ok(IdentityClaims {
            subject: token.to_string(),
            display_name: Some(token.to_uppercase()),
            email: Some(format!("{token}@example.org")),
            avatar_url: None,
        })
    }
}

#[derive(Default)]
pub struct FakeGateway {
    sessions: DashMap<String, GatewaySession>,
    next_ids: Mutex<VecDeque<String>>,
    counter: AtomicUsize,
    pub fetches: AtomicUsize,
}

impl FakeGateway {
    /// The next checkout gets this id instead of a generated one.
    pub fn queue_session_id(&self, id: &str) {
        self.next_ids.lock().unwrap().push_back(id.to_string());
    }

    pub fn mark_paid(&self, id: &str) {
        self.sessions.get_mut(id).expect("unknown session").paid = true;
    }

    /// Registers a session that was created outside our checkout flow.
    pub fn insert_session(&self, session: GatewaySession) {
        self.sessions.insert(session.session_id.clone(), session);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        let id = self.next_ids.lock().unwrap().pop_front().unwrap_or_else(|| {
            format!("sess_{}", self.counter.fetch_add(1, Ordering::SeqCst))
        });
        self.sessions.insert(
            id.clone(),
            GatewaySession {
                session_id: id.clone(),
                paid: false,
                amount_total: Some(request.amount),
                currency: Some(request.currency.clone()),
                metadata: Some(request.metadata.clone()),
            },
        );
        Ok(CheckoutSession {
            url: format!("https://pay.example/{id}"),
            session_id: id,
        })
    }

    async fn fetch_session(&self, session_id: &str) -> Result<Option<GatewaySession>, GatewayError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.sessions.get(session_id).map(|s| s.clone()))
    }
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway::default());
        let engine = Engine::new(store.clone(), Arc::new(TrustingIdentity), gateway.clone(), settings);
        Self {
            engine,
            store,
            gateway,
        }
    }

    pub async fn citizen(&self, subject: &str) -> Session {
        self.engine.verify_session(subject).await.unwrap()
    }

    /// Seeds an account with a privileged role, then signs it in.
    pub async fn with_role(&self, subject: &str, role: Role) -> Session {
        let user = User::from_identity(
            &IdentityClaims {
                subject: subject.into(),
                ..Default::default()
            },
            role,
        );
        assert!(self.store.insert_user(user).await.unwrap());
        self.engine.verify_session(subject).await.unwrap()
    }

    pub async fn staff(&self, subject: &str) -> Session {
        self.with_role(subject, Role::Staff).await
    }

    pub async fn admin(&self, subject: &str) -> Session {
        self.with_role(subject, Role::Admin).await
    }

    /// Fresh session for an existing account, picking up flag changes.
    pub async fn refresh(&self, session: &Session) -> Session {
        self.engine
            .verify_session(&session.user().subject)
            .await
            .unwrap()
    }

    pub async fn report(&self, session: &Session, title: &str) -> Issue {
        self.engine
            .create_issue(session, payload(title))
            .await
            .unwrap()
    }
}

pub fn payload(title: &str) -> IssuePayload {
    IssuePayload {
        title: title.into(),
        description: "Reported from the street".into(),
        category: "road".into(),
        location: "Main Street".into(),
    }
}
