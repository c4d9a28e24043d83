//! Track of the Day ingestion: pulls TOTD maps and author-medal leaderboards
//! from the Trackmania live/core services and reconciles them into storage.

pub mod config;
pub mod database_ops;
pub mod error;
pub mod logging;
pub mod model;
pub mod nadeo;
pub mod sync_engine;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use config::{NadeoConfig, SyncConfig};
pub use error::{Result, SyncError};
pub use sync_engine::{IngestSummary, RecheckSummary, RefreshSummary, SyncEngine, TotdUpstream};
