//! Shared types, error taxonomy, resolver contract and configuration for the
//! in-process messaging kernel.
//!
//! This crate has no knowledge of commands, events, or tasks specifically —
//! it is the substrate the `kernel-commands`, `kernel-events`, and
//! `kernel-tasks` crates build on, the way `tasker-shared` underlies the
//! orchestration and worker crates it sits beneath.

pub mod clock;
pub mod config;
pub mod error;
pub mod ids;
pub mod invocation;
pub mod resolver;
pub mod routing;

pub use clock::{Clock, FrozenClock, SystemClock};
pub use config::KernelConfig;
pub use error::{KernelError, KernelResult};
pub use ids::{ExtensionId, TaskId};
pub use invocation::{invoke_with_deadline, InvocationOutcome};
pub use resolver::{HandlerResolver, ScopedHandler, SingletonResolver};
pub use routing::RoutingKey;
