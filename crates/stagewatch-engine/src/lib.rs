//! Graph state reconciliation: the authoritative store, the engine that
//! merges layout and status events into it, the reconnect policy and the
//! session that owns them.

pub mod pending;
pub mod reconcile;
pub mod resync;
pub mod session;
pub mod store;

pub use pending::{PendingBuffer, PendingPush};
pub use reconcile::{transition, Disposition, EngineStats, ReconciliationEngine, ResyncSummary};
pub use resync::{BackfillPolicy, ReconnectOutcome};
pub use session::{InspectionSession, SessionOptions};
pub use store::{GraphStateStore, Listener, Subscription};
