//! Authenticated actors and how they are resolved from a request.
//!
//! Authentication itself happens upstream. This service trusts the
//! identity headers set by the gateway in front of it and never infers a
//! role from the route being accessed.

use std::fmt;
use std::str::FromStr;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::errors::{BrokerageError, Result};
use crate::models::Party;

pub const HEADER_ID: &str = "x-principal-id";
pub const HEADER_NAME: &str = "x-principal-name";
pub const HEADER_EMAIL: &str = "x-principal-email";
pub const HEADER_ROLE: &str = "x-principal-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Role {
    Student,
    Agent,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Agent => "agent",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = BrokerageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Self::Student),
            "agent" => Ok(Self::Agent),
            "admin" => Ok(Self::Admin),
            other => Err(BrokerageError::Validation(format!("unknown role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Principal {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
}

impl Principal {
    pub fn party(&self) -> Party {
        Party {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Fails with `Forbidden` unless the principal holds one of `roles`.
    pub fn require_role(&self, roles: &[Role], action: &str) -> Result<()> {
        if roles.contains(&self.role) {
            Ok(())
        } else {
            Err(BrokerageError::Forbidden(format!(
                "{} may not {action}",
                self.role
            )))
        }
    }
}

/// Turns an incoming request into the acting principal, if any.
pub trait PrincipalResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Result<Option<Principal>>;
}

/// Reads the identity headers injected by the authenticating gateway.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderPrincipalResolver;

impl PrincipalResolver for HeaderPrincipalResolver {
    fn resolve(&self, headers: &HeaderMap) -> Result<Option<Principal>> {
        let header = |name: &str| -> Option<String> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        };

        let Some(id) = header(HEADER_ID) else {
            return Ok(None);
        };
        let role = header(HEADER_ROLE)
            .ok_or_else(|| BrokerageError::Validation(format!("missing {HEADER_ROLE} header")))?
            .parse()?;
        let email = header(HEADER_EMAIL)
            .ok_or_else(|| BrokerageError::Validation(format!("missing {HEADER_EMAIL} header")))?;

        Ok(Some(Principal {
            name: header(HEADER_NAME).unwrap_or_else(|| id.clone()),
            email,
            id,
            role,
        }))
    }
}
