//! Task engine: single-consumer publish/subscribe with retries and smooth
//! progress reporting.

mod engine;
mod handler;
mod options;
mod progress;
mod state;
mod step;
mod store;
mod subscription;

pub use engine::{TaskEngine, TaskSubscriptionHandle};
pub use handler::{TaskHandler, TaskPayload};
pub use options::TaskOptions;
pub use progress::{ProgressContext, ProgressUpdate};
pub use state::{TaskState, TaskStatus};
pub use step::ProgressStep;
pub use store::{StateChangeHandle, TaskStateStore};
