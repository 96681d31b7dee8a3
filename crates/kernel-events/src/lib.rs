//! Event bus: publish/subscribe fan-out with optional sequential
//! transactions.

mod bus;
mod handler;
mod options;
mod subscription;
mod transaction;

pub use bus::{EventBus, SubscriptionHandle};
pub use handler::EventHandler;
pub use options::EventOptions;
pub use transaction::{EventTransaction, TransactionState};
