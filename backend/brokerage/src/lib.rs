//! Brokerage service core.
//!
//! Students submit paid work requests that agents fulfil, and anyone may
//! trade resources on a marketplace that is open for one hour a day.
//!
//! | Concern                | Module        |
//! |------------------------|---------------|
//! | Trading window         | [`window`]    |
//! | Records & invariants   | [`store`]     |
//! | Payment reconciliation | [`engine`]    |
//! | Reporting              | [`analytics`] |
//! | HTTP surface           | [`api`]       |

pub mod analytics;
pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod models;
pub mod notify;
pub mod principal;
pub mod store;
pub mod window;

#[cfg(test)]
mod fixtures;
#[cfg(test)]
mod test_api;
#[cfg(test)]
mod test_store;

pub use engine::{Engine, EngineSettings, Outcome};
pub use errors::{BrokerageError, ErrorKind, Result};
