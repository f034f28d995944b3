pub mod charges;
pub mod error;
pub mod events;
pub mod models;
pub mod money;
pub mod rates;
pub mod reachability;
pub mod reconciliation;
pub mod segments;
pub mod session;
pub mod time;
