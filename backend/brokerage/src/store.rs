//! Lifecycle store — the only place project, payment, listing and purchase
//! records are written.
//!
//! Every mutator that touches more than one row runs inside a single
//! SQLite transaction, and every status change is a conditional
//! `UPDATE … WHERE status = ?` whose `rows_affected()` decides the winner.
//! Mutators lead with their write so the transaction takes the write lock
//! before it reads; concurrent callers serialize on that lock instead of
//! racing on a stale read.
//!
//! Marketplace listings are never decremented or deactivated by a
//! purchase. Any number of distinct transactions may buy the same active
//! listing.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::is_unique_violation;
use crate::errors::{BrokerageError, Result};
use crate::models::{
    Listing, ListingRow, ListingStatus, Money, NewListing, NewProject, Party, Payment,
    PaymentConfirmation, PaymentStatus, Project, ProjectRow, ProjectStatus, Purchase,
    PurchaseRow, PurchaseStatus,
};
use crate::principal::{Principal, Role};

const SELECT_PROJECT: &str = r#"
    SELECT id, title, description, due_date, team_size, report_copies,
           student_id, student_name, student_email,
           agent_id, agent_name, agent_email,
           status, created_at, assigned_at, completed_at,
           payment_transaction_id, payment_amount, payment_date
    FROM   projects
"#;

const SELECT_PAYMENT: &str = r#"
    SELECT id, project_id, student_id, amount, transaction_id, method, status, created_at
    FROM   payments
"#;

const SELECT_LISTING: &str = r#"
    SELECT id, title, description, price, original_price, discount,
           seller_id, seller_name, seller_email, status, created_at
    FROM   listings
"#;

const SELECT_PURCHASE: &str = r#"
    SELECT id, listing_id, listing_title, price,
           buyer_id, buyer_name, buyer_email,
           seller_id, seller_name, seller_email,
           transaction_id, status, created_at
    FROM   purchases
"#;

#[derive(Debug, Clone)]
pub struct LifecycleStore {
    pool: SqlitePool,
}

impl LifecycleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ─────────────────────────────────────────────────────────
    // Principals
    // ─────────────────────────────────────────────────────────

    /// Record (or refresh) a principal seen on an authenticated request.
    pub async fn upsert_principal(&self, principal: &Principal, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO principals (id, name, email, role, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                email = excluded.email,
                role = excluded.role,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&principal.id)
        .bind(&principal.name)
        .bind(&principal.email)
        .bind(principal.role)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_principal(&self, id: &str) -> Result<Principal> {
        sqlx::query_as::<_, Principal>(
            "SELECT id, name, email, role FROM principals WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BrokerageError::not_found("principal", id))
    }

    // ─────────────────────────────────────────────────────────
    // Projects
    // ─────────────────────────────────────────────────────────

    /// Create a project in `PendingPayment` for `student`.
    pub async fn create_project(
        &self,
        student: &Principal,
        input: &NewProject,
        now: DateTime<Utc>,
    ) -> Result<Project> {
        input.validate(now.date_naive())?;

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO projects
                (id, title, description, due_date, team_size, report_copies,
                 student_id, student_name, student_email, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&id)
        .bind(input.title.trim())
        .bind(&input.description)
        .bind(input.due_date)
        .bind(i64::from(input.team_size))
        .bind(i64::from(input.report_copies))
        .bind(&student.id)
        .bind(&student.name)
        .bind(&student.email)
        .bind(ProjectStatus::PendingPayment)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(project_id = %id, student_id = %student.id, "Project submitted");
        self.get_project(&id).await
    }

    pub async fn get_project(&self, id: &str) -> Result<Project> {
        let mut conn = self.pool.acquire().await?;
        load_project(&mut conn, id).await
    }

    /// Projects visible to `principal`, newest first: a student's own
    /// submissions, an agent's assignments, or everything for an admin.
    pub async fn projects_for(&self, principal: &Principal) -> Result<Vec<Project>> {
        let filter = match principal.role {
            Role::Student => "WHERE student_id = ?1",
            Role::Agent => "WHERE agent_id = ?1",
            Role::Admin => "WHERE ?1 IS NOT NULL",
        };
        let rows = sqlx::query_as::<_, ProjectRow>(&format!(
            "{SELECT_PROJECT} {filter} ORDER BY created_at DESC, id ASC"
        ))
        .bind(&principal.id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Project::from).collect())
    }

    pub async fn recent_projects(&self, limit: u32) -> Result<Vec<Project>> {
        let rows = sqlx::query_as::<_, ProjectRow>(&format!(
            "{SELECT_PROJECT} ORDER BY created_at DESC, id ASC LIMIT ?1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Project::from).collect())
    }

    /// Record a confirmed payment and move the project to `Paid`.
    ///
    /// The status change, the payment row and its tracking row commit
    /// together or not at all. A transaction id already recorded for this
    /// project fails with `DuplicateTransaction`, whatever the project's
    /// current status. One already recorded for a different project fails
    /// with `InvalidState` and leaves this project pending.
    pub async fn record_payment(
        &self,
        project_id: &str,
        confirmation: &PaymentConfirmation,
        now: DateTime<Utc>,
    ) -> Result<(Payment, Project)> {
        confirmation.validate()?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE projects
            SET    status = ?1,
                   payment_transaction_id = ?2,
                   payment_amount = ?3,
                   payment_date = ?4
            WHERE  id = ?5 AND status = ?6
            "#,
        )
        .bind(ProjectStatus::Paid)
        .bind(&confirmation.transaction_id)
        .bind(confirmation.amount)
        .bind(now)
        .bind(project_id)
        .bind(ProjectStatus::PendingPayment)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            if find_payment(&mut tx, project_id, &confirmation.transaction_id)
                .await?
                .is_some()
            {
                return Err(BrokerageError::DuplicateTransaction {
                    transaction_id: confirmation.transaction_id.clone(),
                });
            }
            let project = load_project(&mut tx, project_id).await?;
            return Err(transition_error(&project, ProjectStatus::PendingPayment, "pay for"));
        }

        let project = load_project(&mut tx, project_id).await?;
        let payment = Payment {
            id: Uuid::new_v4().to_string(),
            project_id: project.id.clone(),
            student_id: project.student.id.clone(),
            amount: confirmation.amount,
            transaction_id: confirmation.transaction_id.clone(),
            method: confirmation.method().to_string(),
            status: PaymentStatus::Completed,
            created_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO payments
                (id, project_id, student_id, amount, transaction_id, method, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&payment.id)
        .bind(&payment.project_id)
        .bind(&payment.student_id)
        .bind(payment.amount)
        .bind(&payment.transaction_id)
        .bind(&payment.method)
        .bind(payment.status)
        .bind(payment.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            // Same-project replays were caught above, so a collision here
            // means the transaction already paid for another project.
            if is_unique_violation(&e) {
                BrokerageError::InvalidState(format!(
                    "transaction {} already paid for another project",
                    confirmation.transaction_id
                ))
            } else {
                e.into()
            }
        })?;

        insert_tracking(
            &mut tx,
            TrackedItem::Project,
            &project.id,
            &project.title,
            payment.amount,
            &confirmation.payer.clone().into(),
            confirmation.location(),
            now,
        )
        .await?;

        tx.commit().await?;

        info!(
            project_id = %project.id,
            transaction_id = %payment.transaction_id,
            amount = %payment.amount,
            "Payment recorded"
        );
        Ok((payment, project))
    }

    pub async fn find_payment(
        &self,
        project_id: &str,
        transaction_id: &str,
    ) -> Result<Option<Payment>> {
        let mut conn = self.pool.acquire().await?;
        find_payment(&mut conn, project_id, transaction_id).await
    }

    pub async fn payments_for_project(&self, project_id: &str) -> Result<Vec<Payment>> {
        let rows = sqlx::query_as::<_, Payment>(&format!(
            "{SELECT_PAYMENT} WHERE project_id = ?1 ORDER BY created_at ASC"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// `Paid` → `InProgress`, stamping the agent and `assigned_at`.
    pub async fn assign_agent(
        &self,
        project_id: &str,
        agent: &Party,
        now: DateTime<Utc>,
    ) -> Result<Project> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE projects
            SET    status = ?1, agent_id = ?2, agent_name = ?3, agent_email = ?4, assigned_at = ?5
            WHERE  id = ?6 AND status = ?7
            "#,
        )
        .bind(ProjectStatus::InProgress)
        .bind(&agent.id)
        .bind(&agent.name)
        .bind(&agent.email)
        .bind(now)
        .bind(project_id)
        .bind(ProjectStatus::Paid)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let project = load_project(&mut tx, project_id).await?;
        if updated == 0 {
            return Err(transition_error(&project, ProjectStatus::Paid, "assign"));
        }
        tx.commit().await?;

        info!(project_id = %project_id, agent_id = %agent.id, "Agent assigned");
        Ok(project)
    }

    /// `InProgress` → `Completed`, stamping `completed_at`.
    pub async fn complete_project(&self, project_id: &str, now: DateTime<Utc>) -> Result<Project> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE projects SET status = ?1, completed_at = ?2 WHERE id = ?3 AND status = ?4",
        )
        .bind(ProjectStatus::Completed)
        .bind(now)
        .bind(project_id)
        .bind(ProjectStatus::InProgress)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let project = load_project(&mut tx, project_id).await?;
        if updated == 0 {
            return Err(transition_error(&project, ProjectStatus::InProgress, "complete"));
        }
        tx.commit().await?;

        info!(project_id = %project_id, "Project completed");
        Ok(project)
    }

    // ─────────────────────────────────────────────────────────
    // Marketplace
    // ─────────────────────────────────────────────────────────

    /// List a product. The discount is derived from the two prices and
    /// clamped at zero when the price exceeds the original.
    pub async fn create_listing(
        &self,
        seller: &Principal,
        input: &NewListing,
        now: DateTime<Utc>,
    ) -> Result<Listing> {
        input.validate()?;

        let id = Uuid::new_v4().to_string();
        let discount = input.discount();
        sqlx::query(
            r#"
            INSERT INTO listings
                (id, title, description, price, original_price, discount,
                 seller_id, seller_name, seller_email, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&id)
        .bind(input.title.trim())
        .bind(&input.description)
        .bind(input.price)
        .bind(input.original_price)
        .bind(i64::from(discount))
        .bind(&seller.id)
        .bind(&seller.name)
        .bind(&seller.email)
        .bind(ListingStatus::Active)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(listing_id = %id, seller_id = %seller.id, discount, "Listing created");
        self.get_listing(&id).await
    }

    pub async fn get_listing(&self, id: &str) -> Result<Listing> {
        sqlx::query_as::<_, ListingRow>(&format!("{SELECT_LISTING} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Listing::from)
            .ok_or_else(|| BrokerageError::not_found("listing", id))
    }

    pub async fn active_listings(&self) -> Result<Vec<Listing>> {
        let rows = sqlx::query_as::<_, ListingRow>(&format!(
            "{SELECT_LISTING} WHERE status = ?1 ORDER BY created_at DESC, id ASC"
        ))
        .bind(ListingStatus::Active)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Listing::from).collect())
    }

    /// `Active` → `Removed`. Past purchases keep their snapshot.
    pub async fn remove_listing(&self, id: &str) -> Result<Listing> {
        let updated = sqlx::query("UPDATE listings SET status = ?1 WHERE id = ?2 AND status = ?3")
            .bind(ListingStatus::Removed)
            .bind(id)
            .bind(ListingStatus::Active)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let listing = self.get_listing(id).await?;
        if updated == 0 {
            return Err(BrokerageError::InvalidState(format!(
                "listing {id} is already removed"
            )));
        }
        info!(listing_id = %id, "Listing removed");
        Ok(listing)
    }

    /// Record a marketplace sale against an active listing.
    ///
    /// The purchase row is written with `INSERT … SELECT` so the listing
    /// snapshot and the availability check happen in one statement. Fails
    /// with `NotFound` when the listing is missing or removed and with
    /// `DuplicateTransaction` when this listing already has a purchase for
    /// the transaction id. The listing itself is left unchanged.
    pub async fn record_purchase(
        &self,
        listing_id: &str,
        confirmation: &PaymentConfirmation,
        buyer: &Party,
        now: DateTime<Utc>,
    ) -> Result<Purchase> {
        confirmation.validate()?;
        let mut tx = self.pool.begin().await?;
        let id = Uuid::new_v4().to_string();

        let inserted = sqlx::query(
            r#"
            INSERT INTO purchases
                (id, listing_id, listing_title, price,
                 buyer_id, buyer_name, buyer_email,
                 seller_id, seller_name, seller_email,
                 transaction_id, status, created_at)
            SELECT ?1, id, title, price, ?2, ?3, ?4, seller_id, seller_name, seller_email, ?5, ?6, ?7
            FROM   listings
            WHERE  id = ?8 AND status = ?9
            "#,
        )
        .bind(&id)
        .bind(&buyer.id)
        .bind(&buyer.name)
        .bind(&buyer.email)
        .bind(&confirmation.transaction_id)
        .bind(PurchaseStatus::Completed)
        .bind(now)
        .bind(listing_id)
        .bind(ListingStatus::Active)
        .execute(&mut *tx)
        .await
        .map_err(|e| duplicate_or(e, &confirmation.transaction_id))?
        .rows_affected();

        if inserted == 0 {
            debug!(listing_id = %listing_id, "Purchase rejected: listing missing or removed");
            return Err(BrokerageError::not_found("active listing", listing_id));
        }

        let purchase = sqlx::query_as::<_, PurchaseRow>(&format!("{SELECT_PURCHASE} WHERE id = ?1"))
            .bind(&id)
            .fetch_one(&mut *tx)
            .await
            .map(Purchase::from)?;

        insert_tracking(
            &mut tx,
            TrackedItem::Listing,
            &purchase.listing_id,
            &purchase.listing_title,
            purchase.price,
            buyer,
            confirmation.location(),
            now,
        )
        .await?;

        tx.commit().await?;

        info!(
            listing_id = %listing_id,
            purchase_id = %purchase.id,
            transaction_id = %purchase.transaction_id,
            "Purchase recorded"
        );
        Ok(purchase)
    }

    pub async fn find_purchase(
        &self,
        listing_id: &str,
        transaction_id: &str,
    ) -> Result<Option<Purchase>> {
        let row = sqlx::query_as::<_, PurchaseRow>(&format!(
            "{SELECT_PURCHASE} WHERE listing_id = ?1 AND transaction_id = ?2"
        ))
        .bind(listing_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Purchase::from))
    }

    pub async fn purchases_for_listing(&self, listing_id: &str) -> Result<Vec<Purchase>> {
        let rows = sqlx::query_as::<_, PurchaseRow>(&format!(
            "{SELECT_PURCHASE} WHERE listing_id = ?1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Purchase::from).collect())
    }

    /// Number of purchase-tracking rows, by item kind.
    pub async fn tracking_count(&self, kind: TrackedItem) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM purchase_tracking WHERE item_kind = ?1")
                .bind(kind.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedItem {
    Project,
    Listing,
}

impl TrackedItem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Listing => "listing",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Connection-level helpers (usable inside a transaction)
// ─────────────────────────────────────────────────────────

async fn load_project(conn: &mut SqliteConnection, id: &str) -> Result<Project> {
    sqlx::query_as::<_, ProjectRow>(&format!("{SELECT_PROJECT} WHERE id = ?1"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .map(Project::from)
        .ok_or_else(|| BrokerageError::not_found("project", id))
}

async fn find_payment(
    conn: &mut SqliteConnection,
    project_id: &str,
    transaction_id: &str,
) -> Result<Option<Payment>> {
    let payment = sqlx::query_as::<_, Payment>(&format!(
        "{SELECT_PAYMENT} WHERE project_id = ?1 AND transaction_id = ?2"
    ))
    .bind(project_id)
    .bind(transaction_id)
    .fetch_optional(conn)
    .await?;
    Ok(payment)
}

#[allow(clippy::too_many_arguments)]
async fn insert_tracking(
    conn: &mut SqliteConnection,
    kind: TrackedItem,
    item_id: &str,
    item_name: &str,
    price: Money,
    user: &Party,
    location: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO purchase_tracking
            (item_kind, item_id, item_name, price, user_id, user_name, user_email, location, purchased_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(kind.as_str())
    .bind(item_id)
    .bind(item_name)
    .bind(price)
    .bind(&user.id)
    .bind(&user.name)
    .bind(&user.email)
    .bind(location)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

fn transition_error(project: &Project, expected: ProjectStatus, action: &str) -> BrokerageError {
    BrokerageError::InvalidState(format!(
        "cannot {action} project {} in status {} (requires {expected})",
        project.id, project.status
    ))
}

fn duplicate_or(err: sqlx::Error, transaction_id: &str) -> BrokerageError {
    if is_unique_violation(&err) {
        BrokerageError::DuplicateTransaction {
            transaction_id: transaction_id.to_string(),
        }
    } else {
        err.into()
    }
}
