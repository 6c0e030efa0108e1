//! Family Points - behavior points ledger for families
//!
//! Parents and guardians define point rules (rewards and punishments), record
//! behaviors against them and approve pending ones; children spend their
//! balance on rewards.
//!
//! ## Architecture
//!
//! - **db**: SQLite repositories; `ledger` is the only writer of balances
//! - **services**: recorder, approval workflow, redemption processor and
//!   family management, each guarded by family membership
//! - **http**: JSON API over hyper, authenticated with bearer JWTs
//!
//! ## Ledger guarantees
//!
//! Every point change is a `ledger_entries` row keyed by the id of the event
//! that caused it, written in the same SQLite transaction as the relative
//! balance update. An event id is applied at most once, and a child's balance
//! always equals the sum of its entries.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/family-points/
//! ├── ledger.db       # SQLite database (WAL mode)
//! └── config.toml     # Configuration
//! ```

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod services;

// Re-exports
pub use auth::{Claims, JwtValidator};
pub use config::Config;
pub use db::LedgerDb;
pub use error::LedgerError;
pub use http::HttpServer;
pub use services::{EventBus, LedgerEvent, RetryPolicy, Services, Subscription};
