//! Order and position state: the authoritative local view of what is open
//! and what is held, kept in sync via the private stream and HTTP polls.

pub mod lifecycle;
pub mod position;

pub use lifecycle::{FillEvent, OrderLifecycleManager, OrderRecord};
pub use position::{PositionManager, PositionRecord, SessionCounters, WalletSnapshot};
