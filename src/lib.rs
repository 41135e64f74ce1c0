pub mod config;
pub mod engine;
pub mod limits;
pub mod locations;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reconciler;
pub mod wal;
