//! Records owned by the lifecycle store and the validated inputs that
//! create them.
//!
//! ```text
//! PendingPayment ──► Paid ──► InProgress ──► Completed
//! ```
//!
//! Project status only ever moves one step forward. Agent details exist
//! only from `InProgress` on and the payment summary only from `Paid` on;
//! both are modelled as `Option`s populated by the transition that
//! introduces them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{BrokerageError, Result};

pub const MIN_TEAM_SIZE: u32 = 1;
pub const MAX_TEAM_SIZE: u32 = 5;
pub const MIN_REPORT_COPIES: u32 = 1;
pub const MAX_REPORT_COPIES: u32 = 5;
pub const DEFAULT_PAYMENT_METHOD: &str = "PayPal";
pub const UNKNOWN_LOCATION: &str = "Unknown";

// ─────────────────────────────────────────────────────────
// Money
// ─────────────────────────────────────────────────────────

/// Fixed-point amount in minor units (cents).
///
/// Serialized as a two-decimal string (`"12.50"`); deserialized from either
/// a string or a JSON number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = BrokerageError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BrokerageError::Validation(format!("invalid amount: {s:?}"));
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty()
            || frac.len() > 2
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let whole: i64 = whole.parse().map_err(|_| invalid())?;
        let frac: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };
        let cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac))
            .ok_or_else(invalid)?;
        Ok(Money(if negative { -cents } else { cents }))
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Int(i64),
            Float(f64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Int(units) => units
                .checked_mul(100)
                .map(Money)
                .ok_or_else(|| serde::de::Error::custom("amount out of range")),
            Repr::Float(f) if f.is_finite() && f.abs() < (i64::MAX / 100) as f64 => {
                let cents = f * 100.0;
                if (cents - cents.round()).abs() > 1e-6 {
                    return Err(serde::de::Error::custom(format!(
                        "invalid amount: {f} has more than two decimal places"
                    )));
                }
                Ok(Money(cents.round() as i64))
            }
            Repr::Float(_) => Err(serde::de::Error::custom("amount out of range")),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Identity snapshots
// ─────────────────────────────────────────────────────────

/// Denormalized identity of a principal at the time a record was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl Party {
    fn from_columns(
        id: Option<String>,
        name: Option<String>,
        email: Option<String>,
    ) -> Option<Self> {
        Some(Self {
            id: id?,
            name: name?,
            email: email?,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Project
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProjectStatus {
    PendingPayment,
    Paid,
    InProgress,
    Completed,
}

impl ProjectStatus {
    /// The single status this one may advance to.
    pub fn next(&self) -> Option<ProjectStatus> {
        match self {
            Self::PendingPayment => Some(Self::Paid),
            Self::Paid => Some(Self::InProgress),
            Self::InProgress => Some(Self::Completed),
            Self::Completed => None,
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PendingPayment => "Pending Payment",
            Self::Paid => "Paid",
            Self::InProgress => "In Progress",
            Self::Completed => "Completed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentSummary {
    pub transaction_id: String,
    pub amount: Money,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: String,
    pub title: String,
    pub description: String,
    pub due_date: NaiveDate,
    pub team_size: u32,
    pub report_copies: u32,
    pub student: Party,
    pub agent: Option<Party>,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub payment_summary: Option<PaymentSummary>,
}

/// Flat `projects` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectRow {
    pub id: String,
    pub title: String,
    pub description: String,
    pub due_date: NaiveDate,
    pub team_size: i64,
    pub report_copies: i64,
    pub student_id: String,
    pub student_name: String,
    pub student_email: String,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub agent_email: Option<String>,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub payment_transaction_id: Option<String>,
    pub payment_amount: Option<Money>,
    pub payment_date: Option<DateTime<Utc>>,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        let payment_summary = match (
            row.payment_transaction_id,
            row.payment_amount,
            row.payment_date,
        ) {
            (Some(transaction_id), Some(amount), Some(date)) => Some(PaymentSummary {
                transaction_id,
                amount,
                date,
            }),
            _ => None,
        };

        Project {
            id: row.id,
            title: row.title,
            description: row.description,
            due_date: row.due_date,
            team_size: u32::try_from(row.team_size).unwrap_or_default(),
            report_copies: u32::try_from(row.report_copies).unwrap_or_default(),
            student: Party {
                id: row.student_id,
                name: row.student_name,
                email: row.student_email,
            },
            agent: Party::from_columns(row.agent_id, row.agent_name, row.agent_email),
            status: row.status,
            created_at: row.created_at,
            assigned_at: row.assigned_at,
            completed_at: row.completed_at,
            payment_summary,
        }
    }
}

/// Validated project submission.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewProject {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub due_date: NaiveDate,
    pub team_size: u32,
    pub report_copies: u32,
}

impl NewProject {
    /// `today` is the submission date; the due date must be strictly after it.
    pub fn validate(&self, today: NaiveDate) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(BrokerageError::Validation("title is required".into()));
        }
        if self.due_date <= today {
            return Err(BrokerageError::Validation(format!(
                "due date {} must be in the future",
                self.due_date
            )));
        }
        if !(MIN_TEAM_SIZE..=MAX_TEAM_SIZE).contains(&self.team_size) {
            return Err(BrokerageError::Validation(format!(
                "team size must be {MIN_TEAM_SIZE}-{MAX_TEAM_SIZE}, got {}",
                self.team_size
            )));
        }
        if !(MIN_REPORT_COPIES..=MAX_REPORT_COPIES).contains(&self.report_copies) {
            return Err(BrokerageError::Validation(format!(
                "report copies must be {MIN_REPORT_COPIES}-{MAX_REPORT_COPIES}, got {}",
                self.report_copies
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Payment
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentStatus {
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Payment {
    pub id: String,
    pub project_id: String,
    pub student_id: String,
    pub amount: Money,
    pub transaction_id: String,
    pub method: String,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

/// Identity of whoever paid, as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payer {
    pub id: String,
    pub email: String,
    pub name: String,
}

impl From<Payer> for Party {
    fn from(p: Payer) -> Self {
        Party {
            id: p.id,
            name: p.name,
            email: p.email,
        }
    }
}

/// A completed external payment, as delivered by the gateway callback.
/// The same confirmation may arrive more than once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub transaction_id: String,
    pub amount: Money,
    pub payer: Payer,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl PaymentConfirmation {
    pub fn validate(&self) -> Result<()> {
        if self.transaction_id.trim().is_empty() {
            return Err(BrokerageError::Validation(
                "transaction id is required".into(),
            ));
        }
        if !self.amount.is_positive() {
            return Err(BrokerageError::Validation(format!(
                "payment amount must be positive, got {}",
                self.amount
            )));
        }
        Ok(())
    }

    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or(DEFAULT_PAYMENT_METHOD)
    }

    pub fn location(&self) -> &str {
        self.location.as_deref().unwrap_or(UNKNOWN_LOCATION)
    }
}

// ─────────────────────────────────────────────────────────
// Listing
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub id: String,
    pub title: String,
    pub description: String,
    pub price: Money,
    pub original_price: Money,
    pub discount: u32,
    pub seller: Party,
    pub status: ListingStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ListingRow {
    pub id: String,
    pub title: String,
    pub description: String,
    pub price: Money,
    pub original_price: Money,
    pub discount: i64,
    pub seller_id: String,
    pub seller_name: String,
    pub seller_email: String,
    pub status: ListingStatus,
    pub created_at: DateTime<Utc>,
}

impl From<ListingRow> for Listing {
    fn from(row: ListingRow) -> Self {
        Listing {
            id: row.id,
            title: row.title,
            description: row.description,
            price: row.price,
            original_price: row.original_price,
            discount: u32::try_from(row.discount).unwrap_or_default(),
            seller: Party {
                id: row.seller_id,
                name: row.seller_name,
                email: row.seller_email,
            },
            status: row.status,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewListing {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub price: Money,
    pub original_price: Money,
}

impl NewListing {
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(BrokerageError::Validation("title is required".into()));
        }
        if !self.price.is_positive() {
            return Err(BrokerageError::Validation(format!(
                "price must be positive, got {}",
                self.price
            )));
        }
        if self.original_price.cents() < 0 {
            return Err(BrokerageError::Validation(format!(
                "original price must not be negative, got {}",
                self.original_price
            )));
        }
        Ok(())
    }

    pub fn discount(&self) -> u32 {
        discount_percent(self.price, self.original_price)
    }
}

/// `round((original - price) / original * 100)`, half rounding up, clamped
/// to 0 when the price exceeds the original or the original is not positive.
pub fn discount_percent(price: Money, original_price: Money) -> u32 {
    let original = i128::from(original_price.cents());
    let saving = original - i128::from(price.cents());
    if original <= 0 || saving <= 0 {
        return 0;
    }
    let rounded = (saving * 200 + original) / (original * 2);
    u32::try_from(rounded).unwrap_or(u32::MAX)
}

// ─────────────────────────────────────────────────────────
// Purchase
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Completed,
}

/// A marketplace sale. Carries a snapshot of the listing so history is
/// unaffected by later changes to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Purchase {
    pub id: String,
    pub listing_id: String,
    pub listing_title: String,
    pub price: Money,
    pub buyer: Party,
    pub seller: Party,
    pub transaction_id: String,
    pub status: PurchaseStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PurchaseRow {
    pub id: String,
    pub listing_id: String,
    pub listing_title: String,
    pub price: Money,
    pub buyer_id: String,
    pub buyer_name: String,
    pub buyer_email: String,
    pub seller_id: String,
    pub seller_name: String,
    pub seller_email: String,
    pub transaction_id: String,
    pub status: PurchaseStatus,
    pub created_at: DateTime<Utc>,
}

impl From<PurchaseRow> for Purchase {
    fn from(row: PurchaseRow) -> Self {
        Purchase {
            id: row.id,
            listing_id: row.listing_id,
            listing_title: row.listing_title,
            price: row.price,
            buyer: Party {
                id: row.buyer_id,
                name: row.buyer_name,
                email: row.buyer_email,
            },
            seller: Party {
                id: row.seller_id,
                name: row.seller_name,
                email: row.seller_email,
            },
            transaction_id: row.transaction_id,
            status: row.status,
            created_at: row.created_at,
        }
    }
}
