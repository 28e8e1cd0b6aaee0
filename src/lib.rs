pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod plan;
pub mod report;
pub mod result;
pub mod settings;

pub mod postgres;
pub mod sync;

pub use config::Config;
pub use engine::{sync_from_production, SyncEngine};
pub use error::{Error, Result};
pub use plan::{build_plan, SyncPlan, TableSpec};
pub use result::{aggregate, SyncResult, SyncStatus, TableResult, TableStatus};
pub use sync::CancelSignal;
