// Core layer - configuration
pub mod core;

// Domain layer - hits and their wire encoding
pub mod hit;

// Infrastructure - pending-hit storage and network delivery
pub mod store;
pub mod transport;

// Application layer - background delivery
pub mod dispatcher;

#[cfg(test)]
mod testing;

pub use core::Config;
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatchStatsSnapshot};
pub use hit::{AppInfo, Hit, HitKind, Transaction, TransactionItem};
pub use store::{HitStore, MemoryHitStore, SqliteHitStore};
pub use transport::{create_user_agent_string, Address, HttpTransport, Scheme, Transport};
