//! Read-only reporting snapshot for the admin dashboard.
//!
//! Revenue is bucketed by calendar month of the payment's `created_at` in
//! the reference timezone. The monthly series always has
//! [`REVENUE_MONTHS`] entries ending with the current month; months
//! without payments report zero.

use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::errors::{BrokerageError, Result};
use crate::models::{Money, Project, ProjectStatus};
use crate::principal::Role;
use crate::store::LifecycleStore;

pub const REVENUE_MONTHS: usize = 6;

const MONTH_LABELS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsSnapshot {
    pub counts: Counts,
    pub project_status: StatusBreakdown,
    pub revenue: Revenue,
    pub recent_projects: Vec<Project>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub students: i64,
    pub agents: i64,
    pub admins: i64,
    pub projects: i64,
    pub marketplace: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusBreakdown {
    pub pending_payment: i64,
    pub paid: i64,
    pub in_progress: i64,
    pub completed: i64,
}

impl StatusBreakdown {
    fn add(&mut self, status: ProjectStatus, count: i64) {
        match status {
            ProjectStatus::PendingPayment => self.pending_payment += count,
            ProjectStatus::Paid => self.paid += count,
            ProjectStatus::InProgress => self.in_progress += count,
            ProjectStatus::Completed => self.completed += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.pending_payment + self.paid + self.in_progress + self.completed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Revenue {
    /// Sum of every recorded payment.
    pub total: Money,
    pub monthly: Vec<MonthlyRevenue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlyRevenue {
    pub year: i32,
    pub month: u32,
    pub label: &'static str,
    pub revenue: Money,
}

/// Compute the full snapshot at `now`.
pub async fn snapshot(
    store: &LifecycleStore,
    now: DateTime<Utc>,
    timezone: Tz,
    recent_limit: u32,
) -> Result<AnalyticsSnapshot> {
    let pool = store.pool();

    let mut counts = Counts::default();
    let roles: Vec<(Role, i64)> =
        sqlx::query_as("SELECT role, COUNT(*) FROM principals GROUP BY role")
            .fetch_all(pool)
            .await?;
    for (role, count) in roles {
        match role {
            Role::Student => counts.students = count,
            Role::Agent => counts.agents = count,
            Role::Admin => counts.admins = count,
        }
    }

    let mut project_status = StatusBreakdown::default();
    let statuses: Vec<(ProjectStatus, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM projects GROUP BY status")
            .fetch_all(pool)
            .await?;
    for (status, count) in statuses {
        project_status.add(status, count);
    }
    counts.projects = project_status.total();

    // Every listing ever posted, removed ones included.
    let (marketplace,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM listings")
        .fetch_one(pool)
        .await?;
    counts.marketplace = marketplace;

    let payments: Vec<(DateTime<Utc>, Money)> =
        sqlx::query_as("SELECT created_at, amount FROM payments ORDER BY created_at ASC")
            .fetch_all(pool)
            .await?;
    let total = payments
        .iter()
        .try_fold(Money::ZERO, |acc, (_, amount)| acc.checked_add(*amount))
        .ok_or_else(|| BrokerageError::Unavailable("revenue total overflowed".into()))?;
    let monthly = monthly_series(&payments, now, timezone, REVENUE_MONTHS);

    let recent_projects = store.recent_projects(recent_limit).await?;

    Ok(AnalyticsSnapshot {
        counts,
        project_status,
        revenue: Revenue { total, monthly },
        recent_projects,
        generated_at: now,
    })
}

/// Revenue for the `months` calendar months ending with the month of `now`,
/// oldest first.
pub fn monthly_series(
    payments: &[(DateTime<Utc>, Money)],
    now: DateTime<Utc>,
    timezone: Tz,
    months: usize,
) -> Vec<MonthlyRevenue> {
    let local_now = now.with_timezone(&timezone);
    let current = month_index(local_now.year(), local_now.month());

    let mut series: Vec<MonthlyRevenue> = (0..months as i64)
        .rev()
        .map(|back| {
            let index = current - back;
            let year = index.div_euclid(12) as i32;
            let month = index.rem_euclid(12) as u32 + 1;
            MonthlyRevenue {
                year,
                month,
                label: MONTH_LABELS[(month - 1) as usize],
                revenue: Money::ZERO,
            }
        })
        .collect();

    let first = current - months as i64 + 1;
    for (created_at, amount) in payments {
        let local = created_at.with_timezone(&timezone);
        let index = month_index(local.year(), local.month());
        if (first..=current).contains(&index) {
            let bucket = &mut series[(index - first) as usize];
            bucket.revenue = bucket.revenue.checked_add(*amount).unwrap_or(bucket.revenue);
        }
    }
    series
}

fn month_index(year: i32, month: u32) -> i64 {
    i64::from(year) * 12 + i64::from(month) - 1
}
