//! Reconciliation engine — role-scoped actions over the lifecycle store.
//!
//! Each action checks the principal, runs exactly one atomic store
//! mutation under the configured store timeout, and only then attempts
//! its notifications. A failed notification is logged and surfaced as a
//! warning on the [`Outcome`]; it never undoes the committed mutation.
//!
//! Payment confirmations may be delivered more than once. A confirmation
//! whose transaction id is already recorded is reported as a successful
//! replay and sends nothing.
//!
//! The marketplace gate and the purchase insert are separate steps, and a
//! listing has no stock, so two buyers confirming in the last second of
//! the window can both succeed against the same listing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::analytics::{self, AnalyticsSnapshot};
use crate::clock::Clock;
use crate::config::Config;
use crate::errors::{BrokerageError, Result};
use crate::models::{
    Listing, NewListing, NewProject, Payment, PaymentConfirmation, Project, Purchase,
};
use crate::notify::{Notification, Notifier, Template};
use crate::principal::{Principal, Role};
use crate::store::LifecycleStore;
use crate::window::{WindowGate, WindowStatus};

/// Result of a committed action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome<T> {
    pub data: T,
    /// Set when the action committed but a notification could not be sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// `true` when the call replayed an already-recorded transaction.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub replayed: bool,
}

impl<T> Outcome<T> {
    fn committed(data: T, warning: Option<String>) -> Self {
        Self {
            data,
            warning,
            replayed: false,
        }
    }

    fn replay(data: T) -> Self {
        Self {
            data,
            warning: None,
            replayed: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub project: Project,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub gate: WindowGate,
    pub admin_email: String,
    pub store_timeout: Duration,
    pub recent_projects: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let config = Config::default();
        Self {
            gate: WindowGate::default(),
            admin_email: config.admin_email,
            store_timeout: config.store_timeout,
            recent_projects: config.recent_projects,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            gate: WindowGate::new(config.market_timezone, config.market_open_hour)?,
            admin_email: config.admin_email.clone(),
            store_timeout: config.store_timeout,
            recent_projects: config.recent_projects,
        })
    }
}

pub struct Engine {
    store: LifecycleStore,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        store: LifecycleStore,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            settings,
        }
    }

    pub fn store(&self) -> &LifecycleStore {
        &self.store
    }

    /// Remember a principal seen on an authenticated request.
    pub async fn register_principal(&self, principal: &Principal) -> Result<()> {
        let now = self.clock.now();
        self.guarded(self.store.upsert_principal(principal, now)).await
    }

    // ─────────────────────────────────────────────────────────
    // Projects
    // ─────────────────────────────────────────────────────────

    pub async fn submit_project(
        &self,
        principal: &Principal,
        input: NewProject,
    ) -> Result<Outcome<Project>> {
        principal.require_role(&[Role::Student], "submit projects")?;
        let now = self.clock.now();
        let project = self
            .guarded(self.store.create_project(principal, &input, now))
            .await?;

        let warning = self
            .dispatch(vec![Notification::new(
                Template::ProjectSubmission,
                vec![self.settings.admin_email.clone()],
                json!({
                    "title": project.title,
                    "studentName": project.student.name,
                    "dueDate": project.due_date,
                }),
            )])
            .await;
        Ok(Outcome::committed(project, warning))
    }

    pub async fn confirm_project_payment(
        &self,
        principal: &Principal,
        project_id: &str,
        confirmation: PaymentConfirmation,
    ) -> Result<Outcome<PaymentReceipt>> {
        let project = self.guarded(self.store.get_project(project_id)).await?;
        if !(principal.is_admin()
            || (principal.role == Role::Student && project.student.id == principal.id))
        {
            return Err(BrokerageError::Forbidden(
                "only the submitting student may pay for a project".into(),
            ));
        }

        let now = self.clock.now();
        let recorded = self
            .guarded(self.store.record_payment(project_id, &confirmation, now))
            .await;

        let (payment, project) = match recorded {
            Ok(recorded) => recorded,
            Err(BrokerageError::DuplicateTransaction { transaction_id }) => {
                info!(
                    project_id = %project_id,
                    transaction_id = %transaction_id,
                    "Payment confirmation replayed"
                );
                return self.payment_replay(project_id, &transaction_id).await;
            }
            Err(e) => return Err(e),
        };

        let warning = self
            .dispatch(vec![Notification::new(
                Template::PaymentConfirmation,
                vec![project.student.email.clone()],
                json!({
                    "title": project.title,
                    "amount": payment.amount,
                    "transactionId": payment.transaction_id,
                }),
            )
            .cc(self.settings.admin_email.clone())])
            .await;

        Ok(Outcome::committed(PaymentReceipt { payment, project }, warning))
    }

    async fn payment_replay(
        &self,
        project_id: &str,
        transaction_id: &str,
    ) -> Result<Outcome<PaymentReceipt>> {
        let payment = self
            .guarded(self.store.find_payment(project_id, transaction_id))
            .await?
            .ok_or_else(|| BrokerageError::not_found("payment", transaction_id))?;
        let project = self.guarded(self.store.get_project(project_id)).await?;
        Ok(Outcome::replay(PaymentReceipt { payment, project }))
    }

    pub async fn assign_agent(
        &self,
        principal: &Principal,
        project_id: &str,
        agent_id: &str,
    ) -> Result<Outcome<Project>> {
        principal.require_role(&[Role::Admin], "assign agents")?;

        let agent = self.guarded(self.store.get_principal(agent_id)).await?;
        if agent.role != Role::Agent {
            return Err(BrokerageError::Validation(format!(
                "principal {agent_id} is a {}, not an agent",
                agent.role
            )));
        }

        let now = self.clock.now();
        let project = self
            .guarded(self.store.assign_agent(project_id, &agent.party(), now))
            .await?;

        let data = json!({
            "title": project.title,
            "agentName": agent.name,
            "dueDate": project.due_date,
        });
        let warning = self
            .dispatch(vec![
                Notification::new(
                    Template::ProjectAssigned,
                    vec![agent.email.clone()],
                    data.clone(),
                ),
                Notification::new(
                    Template::ProjectAssigned,
                    vec![project.student.email.clone()],
                    data,
                ),
            ])
            .await;
        Ok(Outcome::committed(project, warning))
    }

    pub async fn complete_project(
        &self,
        principal: &Principal,
        project_id: &str,
    ) -> Result<Outcome<Project>> {
        principal.require_role(&[Role::Agent, Role::Admin], "complete projects")?;

        if principal.role == Role::Agent {
            let project = self.guarded(self.store.get_project(project_id)).await?;
            // An unassigned project falls through to the store's state check.
            if matches!(&project.agent, Some(agent) if agent.id != principal.id) {
                return Err(BrokerageError::Forbidden(
                    "only the assigned agent may complete this project".into(),
                ));
            }
        }

        let now = self.clock.now();
        let project = self
            .guarded(self.store.complete_project(project_id, now))
            .await?;

        let mut to = vec![project.student.email.clone()];
        if let Some(agent) = &project.agent {
            to.push(agent.email.clone());
        }
        let warning = self
            .dispatch(vec![Notification::new(
                Template::ProjectCompleted,
                to,
                json!({
                    "title": project.title,
                    "studentName": project.student.name,
                    "agentName": project.agent.as_ref().map(|a| a.name.as_str()),
                }),
            )
            .cc(self.settings.admin_email.clone())])
            .await;
        Ok(Outcome::committed(project, warning))
    }

    /// A student sees their own submissions, an agent their assignments,
    /// an admin everything.
    pub async fn get_project(&self, principal: &Principal, project_id: &str) -> Result<Project> {
        let project = self.guarded(self.store.get_project(project_id)).await?;
        let visible = principal.is_admin()
            || project.student.id == principal.id
            || project.agent.as_ref().is_some_and(|a| a.id == principal.id);
        if !visible {
            return Err(BrokerageError::Forbidden(format!(
                "project {project_id} belongs to another principal"
            )));
        }
        Ok(project)
    }

    pub async fn projects_for(&self, principal: &Principal) -> Result<Vec<Project>> {
        self.guarded(self.store.projects_for(principal)).await
    }

    // ─────────────────────────────────────────────────────────
    // Marketplace
    // ─────────────────────────────────────────────────────────

    pub fn market_status(&self) -> WindowStatus {
        self.settings.gate.status(self.clock.now())
    }

    pub async fn list_marketplace_product(
        &self,
        principal: &Principal,
        input: NewListing,
    ) -> Result<Outcome<Listing>> {
        let now = self.clock.now();
        let listing = self
            .guarded(self.store.create_listing(principal, &input, now))
            .await?;
        Ok(Outcome::committed(listing, None))
    }

    pub async fn active_listings(&self) -> Result<Vec<Listing>> {
        self.guarded(self.store.active_listings()).await
    }

    pub async fn remove_listing(
        &self,
        principal: &Principal,
        listing_id: &str,
    ) -> Result<Outcome<Listing>> {
        let listing = self.guarded(self.store.get_listing(listing_id)).await?;
        if !(principal.is_admin() || listing.seller.id == principal.id) {
            return Err(BrokerageError::Forbidden(
                "only the seller may remove a listing".into(),
            ));
        }
        let listing = self.guarded(self.store.remove_listing(listing_id)).await?;
        Ok(Outcome::committed(listing, None))
    }

    /// Record a marketplace sale, but only while the trading window is open.
    pub async fn confirm_marketplace_purchase(
        &self,
        principal: &Principal,
        listing_id: &str,
        confirmation: PaymentConfirmation,
    ) -> Result<Outcome<Purchase>> {
        confirmation.validate()?;

        // A replay of a sale that already committed is answered from the
        // store even after the window has closed; it changes nothing.
        if let Some(existing) = self
            .guarded(
                self.store
                    .find_purchase(listing_id, &confirmation.transaction_id),
            )
            .await?
        {
            info!(
                listing_id = %listing_id,
                transaction_id = %confirmation.transaction_id,
                "Purchase confirmation replayed"
            );
            return Ok(Outcome::replay(existing));
        }

        let now = self.clock.now();
        let window = self.settings.gate.status(now);
        if !window.is_open {
            warn!(
                listing_id = %listing_id,
                transaction_id = %confirmation.transaction_id,
                "Purchase rejected outside trading window"
            );
            return Err(BrokerageError::MarketClosed(window.time_remaining.to_string()));
        }

        let buyer = principal.party();
        let recorded = self
            .guarded(
                self.store
                    .record_purchase(listing_id, &confirmation, &buyer, now),
            )
            .await;

        let purchase = match recorded {
            Ok(purchase) => purchase,
            Err(BrokerageError::DuplicateTransaction { transaction_id }) => {
                let existing = self
                    .guarded(self.store.find_purchase(listing_id, &transaction_id))
                    .await?
                    .ok_or_else(|| BrokerageError::not_found("purchase", transaction_id.as_str()))?;
                return Ok(Outcome::replay(existing));
            }
            Err(e) => return Err(e),
        };

        let warning = self
            .dispatch(vec![Notification::new(
                Template::MarketplacePurchase,
                vec![purchase.buyer.email.clone(), purchase.seller.email.clone()],
                json!({
                    "productName": purchase.listing_title,
                    "price": purchase.price,
                    "buyerName": purchase.buyer.name,
                    "sellerName": purchase.seller.name,
                }),
            )
            .cc(self.settings.admin_email.clone())])
            .await;
        Ok(Outcome::committed(purchase, warning))
    }

    // ─────────────────────────────────────────────────────────
    // Reporting
    // ─────────────────────────────────────────────────────────

    pub async fn get_analytics(&self, principal: &Principal) -> Result<AnalyticsSnapshot> {
        principal.require_role(&[Role::Admin], "view analytics")?;
        let now = self.clock.now();
        self.guarded(analytics::snapshot(
            &self.store,
            now,
            self.settings.gate.timezone(),
            self.settings.recent_projects,
        ))
        .await
    }

    // ─────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────

    /// Run a store call under the store timeout. A call that times out is
    /// dropped mid-flight, which rolls back any open transaction.
    async fn guarded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.settings.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BrokerageError::Unavailable(format!(
                "store call exceeded {}ms",
                self.settings.store_timeout.as_millis()
            ))),
        }
    }

    /// Send after commit. Returns a warning describing any failures.
    async fn dispatch(&self, notifications: Vec<Notification>) -> Option<String> {
        let mut failures = Vec::new();
        for notification in &notifications {
            let sent =
                tokio::time::timeout(self.settings.store_timeout, self.notifier.send(notification))
                    .await
                    .unwrap_or_else(|_| {
                        Err(BrokerageError::Unavailable("notification timed out".into()))
                    });
            if let Err(e) = sent {
                warn!(
                    template = ?notification.template,
                    to = ?notification.to,
                    "Notification failed: {e}"
                );
                failures.push(format!("{:?}: {e}", notification.template));
            }
        }

        if failures.is_empty() {
            None
        } else {
            Some(format!("notification not sent ({})", failures.join("; ")))
        }
    }
}
