//! Shared setup for the crate's tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Europe::London;

use crate::clock::FixedClock;
use crate::db;
use crate::engine::{Engine, EngineSettings};
use crate::errors::{BrokerageError, Result};
use crate::models::{Money, NewListing, NewProject, Payer, PaymentConfirmation};
use crate::notify::{Notification, Notifier, Template};
use crate::principal::{Principal, Role};
use crate::store::LifecycleStore;

pub const ADMIN_EMAIL: &str = "admin@brokerage.test";

pub fn london(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    London
        .with_ymd_and_hms(y, m, d, h, min, 0)
        .unwrap()
        .with_timezone(&Utc)
}

/// 14 Oct 2026, 22:30 London, inside the trading window.
pub fn open_instant() -> DateTime<Utc> {
    london(2026, 10, 14, 22, 30)
}

/// 14 Oct 2026, 12:00 London, outside the trading window.
pub fn closed_instant() -> DateTime<Utc> {
    london(2026, 10, 14, 12, 0)
}

fn principal(id: &str, name: &str, role: Role) -> Principal {
    Principal {
        id: id.to_string(),
        name: name.to_string(),
        email: format!("{id}@brokerage.test"),
        role,
    }
}

pub fn student() -> Principal {
    principal("student-1", "Sam Student", Role::Student)
}

pub fn other_student() -> Principal {
    principal("student-2", "Sky Student", Role::Student)
}

pub fn agent() -> Principal {
    principal("agent-1", "Alex Agent", Role::Agent)
}

pub fn other_agent() -> Principal {
    principal("agent-2", "Ari Agent", Role::Agent)
}

pub fn admin() -> Principal {
    principal("admin-1", "Ada Admin", Role::Admin)
}

pub fn new_project(title: &str) -> NewProject {
    NewProject {
        title: title.to_string(),
        description: "Final-year report".to_string(),
        due_date: NaiveDate::from_ymd_opt(2026, 12, 1).unwrap(),
        team_size: 2,
        report_copies: 1,
    }
}

pub fn new_listing(price: &str, original_price: &str) -> NewListing {
    NewListing {
        title: "Advanced Algorithms Study Notes".to_string(),
        description: "Sorting, graphs and dynamic programming".to_string(),
        price: price.parse().unwrap(),
        original_price: original_price.parse().unwrap(),
    }
}

pub fn confirmation(transaction_id: &str, amount: &str, payer: &Principal) -> PaymentConfirmation {
    PaymentConfirmation {
        transaction_id: transaction_id.to_string(),
        amount: amount.parse::<Money>().unwrap(),
        payer: Payer {
            id: payer.id.clone(),
            email: payer.email.clone(),
            name: payer.name.clone(),
        },
        method: None,
        location: Some("London".to_string()),
    }
}

pub async fn store() -> LifecycleStore {
    LifecycleStore::new(db::init_memory_pool().await.unwrap())
}

/// Keeps every notification in memory; can be switched to fail.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, template: Template) -> usize {
        self.sent()
            .iter()
            .filter(|n| n.template == template)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BrokerageError::Unavailable("notification transport down".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification.clone());
        Ok(())
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub clock: Arc<FixedClock>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn store(&self) -> &LifecycleStore {
        self.engine.store()
    }
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        admin_email: ADMIN_EMAIL.to_string(),
        ..EngineSettings::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(settings()).await
}

/// An engine over a fresh in-memory store with every fixture principal
/// registered and the clock outside the trading window.
pub async fn harness_with(settings: EngineSettings) -> Harness {
    let clock = Arc::new(FixedClock::new(closed_instant()));
    let notifier = Arc::new(RecordingNotifier::new());
    let engine = Engine::new(store().await, clock.clone(), notifier.clone(), settings);

    for p in [student(), other_student(), agent(), other_agent(), admin()] {
        engine.register_principal(&p).await.unwrap();
    }

    Harness {
        engine: Arc::new(engine),
        clock,
        notifier,
    }
}

#[tokio::test]
async fn recording_notifier_records_and_fails_on_demand() {
    let notifier = RecordingNotifier::new();
    let n = Notification::new(
        Template::ProjectCompleted,
        vec!["a@b.c".into()],
        serde_json::json!({}),
    );
    notifier.send(&n).await.unwrap();
    assert_eq!(notifier.count(Template::ProjectCompleted), 1);

    notifier.set_failing(true);
    assert!(notifier.send(&n).await.is_err());
    assert_eq!(notifier.sent().len(), 1);
}
