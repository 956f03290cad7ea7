use chrono::Duration;

use crate::errors::BrokerageError;
use crate::fixtures::{
    agent, closed_instant, confirmation, new_listing, new_project, other_student, store, student,
};
use crate::invariants::{
    assert_all_project_invariants, assert_discount_in_range, assert_project_immutable_fields,
    assert_valid_status_transition,
};
use crate::models::{ListingStatus, Money, ProjectStatus};
use crate::store::{LifecycleStore, TrackedItem};

async fn paid_project(store: &LifecycleStore, txn: &str) -> String {
    let now = closed_instant();
    let project = store
        .create_project(&student(), &new_project("Thesis"), now)
        .await
        .unwrap();
    store
        .record_payment(&project.id, &confirmation(txn, "100", &student()), now)
        .await
        .unwrap();
    project.id
}

#[tokio::test]
async fn test_new_project_is_pending_without_agent() {
    let store = store().await;
    let project = store
        .create_project(&student(), &new_project("Thesis"), closed_instant())
        .await
        .unwrap();

    assert_eq!(project.status, ProjectStatus::PendingPayment);
    assert!(project.agent.is_none());
    assert!(project.payment_summary.is_none());
    assert_eq!(project.student.id, "student-1");
    assert_eq!(project.created_at, closed_instant());
    assert_all_project_invariants(&project);
}

#[tokio::test]
async fn test_invalid_submission_is_rejected() {
    let store = store().await;
    let now = closed_instant();

    let mut overdue = new_project("Late");
    overdue.due_date = now.date_naive();
    let err = store.create_project(&student(), &overdue, now).await.unwrap_err();
    assert!(matches!(err, BrokerageError::Validation(_)), "{err}");

    let mut crowded = new_project("Crowded");
    crowded.team_size = 9;
    let err = store.create_project(&student(), &crowded, now).await.unwrap_err();
    assert!(matches!(err, BrokerageError::Validation(_)), "{err}");

    assert!(store.projects_for(&student()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_payment_moves_project_to_paid() {
    let store = store().await;
    let now = closed_instant();
    let original = store
        .create_project(&student(), &new_project("Thesis"), now)
        .await
        .unwrap();

    let (payment, project) = store
        .record_payment(&original.id, &confirmation("T1", "100", &student()), now)
        .await
        .unwrap();

    assert_valid_status_transition(original.status, project.status);
    assert_eq!(project.status, ProjectStatus::Paid);
    let summary = project.payment_summary.clone().unwrap();
    assert_eq!(summary.transaction_id, "T1");
    assert_eq!(summary.amount, Money::from_cents(10_000));
    assert_eq!(payment.project_id, original.id);
    assert_eq!(payment.student_id, "student-1");
    assert_eq!(payment.method, "PayPal");
    assert_all_project_invariants(&project);
    assert_project_immutable_fields(&original, &project);
    assert_eq!(store.tracking_count(TrackedItem::Project).await.unwrap(), 1);
}

#[tokio::test]
async fn test_duplicate_payment_is_rejected_once_recorded() {
    let store = store().await;
    let project_id = paid_project(&store, "T1").await;

    let err = store
        .record_payment(
            &project_id,
            &confirmation("T1", "100", &student()),
            closed_instant() + Duration::minutes(1),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, BrokerageError::DuplicateTransaction { ref transaction_id } if transaction_id == "T1"),
        "{err}"
    );

    assert_eq!(store.payments_for_project(&project_id).await.unwrap().len(), 1);
    assert_eq!(store.tracking_count(TrackedItem::Project).await.unwrap(), 1);
}

#[tokio::test]
async fn test_second_transaction_on_paid_project_is_invalid_state() {
    let store = store().await;
    let project_id = paid_project(&store, "T1").await;

    let err = store
        .record_payment(&project_id, &confirmation("T2", "100", &student()), closed_instant())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerageError::InvalidState(_)), "{err}");

    let project = store.get_project(&project_id).await.unwrap();
    assert_eq!(project.payment_summary.unwrap().transaction_id, "T1");
    assert_eq!(store.payments_for_project(&project_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_transaction_cannot_pay_for_two_projects() {
    let store = store().await;
    let now = closed_instant();
    let first = paid_project(&store, "T1").await;
    let second = store
        .create_project(&student(), &new_project("Second"), now)
        .await
        .unwrap();

    let err = store
        .record_payment(&second.id, &confirmation("T1", "100", &student()), now)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerageError::InvalidState(_)), "{err}");

    let second = store.get_project(&second.id).await.unwrap();
    assert_eq!(second.status, ProjectStatus::PendingPayment);
    assert!(second.payment_summary.is_none());
    assert_all_project_invariants(&second);
    assert!(store.payments_for_project(&second.id).await.unwrap().is_empty());
    assert_eq!(store.payments_for_project(&first).await.unwrap().len(), 1);
    assert_eq!(store.tracking_count(TrackedItem::Project).await.unwrap(), 1);

    // A fresh transaction still pays for it.
    store
        .record_payment(&second.id, &confirmation("T2", "100", &student()), now)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_payment_for_unknown_project_is_not_found() {
    let store = store().await;
    let err = store
        .record_payment("missing", &confirmation("T1", "100", &student()), closed_instant())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerageError::NotFound { .. }), "{err}");
}

#[tokio::test]
async fn test_concurrent_confirmations_have_one_winner() {
    let store = store().await;
    let now = closed_instant();
    let project = store
        .create_project(&student(), &new_project("Thesis"), now)
        .await
        .unwrap();

    let mut attempts = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let store = store.clone();
        let project_id = project.id.clone();
        attempts.spawn(async move {
            store
                .record_payment(&project_id, &confirmation("T1", "100", &student()), now)
                .await
        });
    }
    let mut results = Vec::new();
    while let Some(joined) = attempts.join_next().await {
        results.push(joined.unwrap());
    }

    let winners = results.iter().filter(|r| r.is_ok()).count();
    let replays = results
        .iter()
        .filter(|r| matches!(r, Err(BrokerageError::DuplicateTransaction { .. })))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(replays, 7);
    assert_eq!(store.payments_for_project(&project.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_assign_requires_paid() {
    let store = store().await;
    let now = closed_instant();
    let agent = agent().party();

    // PendingPayment
    let pending = store
        .create_project(&student(), &new_project("Pending"), now)
        .await
        .unwrap();
    let err = store.assign_agent(&pending.id, &agent, now).await.unwrap_err();
    assert!(matches!(err, BrokerageError::InvalidState(_)), "{err}");
    assert_eq!(
        store.get_project(&pending.id).await.unwrap().status,
        ProjectStatus::PendingPayment
    );

    // Paid → InProgress succeeds, then InProgress and Completed both reject.
    let project_id = paid_project(&store, "T1").await;
    let project = store.assign_agent(&project_id, &agent, now).await.unwrap();
    assert_eq!(project.status, ProjectStatus::InProgress);
    assert_eq!(project.agent.as_ref().unwrap().id, "agent-1");
    assert_eq!(project.assigned_at, Some(now));
    assert_all_project_invariants(&project);

    let err = store.assign_agent(&project_id, &agent, now).await.unwrap_err();
    assert!(matches!(err, BrokerageError::InvalidState(_)), "{err}");

    store.complete_project(&project_id, now).await.unwrap();
    let err = store.assign_agent(&project_id, &agent, now).await.unwrap_err();
    assert!(matches!(err, BrokerageError::InvalidState(_)), "{err}");

    let err = store.assign_agent("missing", &agent, now).await.unwrap_err();
    assert!(matches!(err, BrokerageError::NotFound { .. }), "{err}");
}

#[tokio::test]
async fn test_complete_requires_in_progress() {
    let store = store().await;
    let now = closed_instant();

    let pending = store
        .create_project(&student(), &new_project("Pending"), now)
        .await
        .unwrap();
    let err = store.complete_project(&pending.id, now).await.unwrap_err();
    assert!(matches!(err, BrokerageError::InvalidState(_)), "{err}");

    let project_id = paid_project(&store, "T1").await;
    let err = store.complete_project(&project_id, now).await.unwrap_err();
    assert!(matches!(err, BrokerageError::InvalidState(_)), "{err}");
    assert_eq!(
        store.get_project(&project_id).await.unwrap().status,
        ProjectStatus::Paid
    );

    store
        .assign_agent(&project_id, &agent().party(), now)
        .await
        .unwrap();
    let later = now + Duration::days(3);
    let done = store.complete_project(&project_id, later).await.unwrap();
    assert_eq!(done.status, ProjectStatus::Completed);
    assert_eq!(done.completed_at, Some(later));
    assert_all_project_invariants(&done);

    // Terminal: every mutator now fails with InvalidState.
    let err = store.complete_project(&project_id, later).await.unwrap_err();
    assert!(matches!(err, BrokerageError::InvalidState(_)), "{err}");
    let err = store
        .record_payment(&project_id, &confirmation("T9", "1", &student()), later)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerageError::InvalidState(_)), "{err}");
}

#[tokio::test]
async fn test_projects_are_scoped_to_principal() {
    let store = store().await;
    let now = closed_instant();
    store
        .create_project(&student(), &new_project("Mine"), now)
        .await
        .unwrap();
    store
        .create_project(&other_student(), &new_project("Theirs"), now + Duration::seconds(1))
        .await
        .unwrap();

    let mine = store.projects_for(&student()).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].title, "Mine");
    assert!(store.projects_for(&agent()).await.unwrap().is_empty());

    let recent = store.recent_projects(1).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].title, "Theirs");
}

#[tokio::test]
async fn test_listing_discount_is_derived_and_clamped() {
    let store = store().await;
    let now = closed_instant();

    let listing = store
        .create_listing(&student(), &new_listing("25", "40"), now)
        .await
        .unwrap();
    assert_eq!(listing.discount, 38);
    assert_eq!(listing.status, ListingStatus::Active);
    assert_discount_in_range(&listing);

    let listing = store
        .create_listing(&student(), &new_listing("40", "40"), now)
        .await
        .unwrap();
    assert_eq!(listing.discount, 0);

    // Priced above the original: stored, with the discount clamped to zero.
    let listing = store
        .create_listing(&student(), &new_listing("55", "40"), now)
        .await
        .unwrap();
    assert_eq!(listing.discount, 0);
    assert_eq!(listing.price, Money::from_cents(5_500));

    let err = store
        .create_listing(&student(), &new_listing("0", "40"), now)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerageError::Validation(_)), "{err}");
}

#[tokio::test]
async fn test_purchase_snapshots_listing_and_leaves_it_active() {
    let store = store().await;
    let now = closed_instant();
    let listing = store
        .create_listing(&student(), &new_listing("25", "40"), now)
        .await
        .unwrap();
    let buyer = other_student();

    let purchase = store
        .record_purchase(&listing.id, &confirmation("P1", "25", &buyer), &buyer.party(), now)
        .await
        .unwrap();
    assert_eq!(purchase.listing_title, listing.title);
    assert_eq!(purchase.price, listing.price);
    assert_eq!(purchase.seller, listing.seller);
    assert_eq!(purchase.buyer.id, "student-2");
    assert_eq!(store.tracking_count(TrackedItem::Listing).await.unwrap(), 1);

    // No stock: the listing is untouched and a second buyer also succeeds.
    assert_eq!(
        store.get_listing(&listing.id).await.unwrap().status,
        ListingStatus::Active
    );
    let second = agent();
    store
        .record_purchase(&listing.id, &confirmation("P2", "25", &second), &second.party(), now)
        .await
        .unwrap();
    assert_eq!(store.purchases_for_listing(&listing.id).await.unwrap().len(), 2);

    let err = store
        .record_purchase(&listing.id, &confirmation("P1", "25", &buyer), &buyer.party(), now)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerageError::DuplicateTransaction { .. }), "{err}");
    assert_eq!(store.purchases_for_listing(&listing.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_removed_or_missing_listing_cannot_be_purchased() {
    let store = store().await;
    let now = closed_instant();
    let buyer = other_student();
    let listing = store
        .create_listing(&student(), &new_listing("25", "40"), now)
        .await
        .unwrap();
    store
        .record_purchase(&listing.id, &confirmation("P1", "25", &buyer), &buyer.party(), now)
        .await
        .unwrap();

    let removed = store.remove_listing(&listing.id).await.unwrap();
    assert_eq!(removed.status, ListingStatus::Removed);
    assert!(store.active_listings().await.unwrap().is_empty());

    let err = store
        .record_purchase(&listing.id, &confirmation("P2", "25", &buyer), &buyer.party(), now)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerageError::NotFound { .. }), "{err}");

    let err = store
        .record_purchase("missing", &confirmation("P3", "25", &buyer), &buyer.party(), now)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerageError::NotFound { .. }), "{err}");

    // History survives removal.
    let history = store.purchases_for_listing(&listing.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].listing_title, listing.title);

    let err = store.remove_listing(&listing.id).await.unwrap_err();
    assert!(matches!(err, BrokerageError::InvalidState(_)), "{err}");
}
