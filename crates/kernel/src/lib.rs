//! The messaging kernel facade: wires the Commands, Events, and Tasks
//! engines behind one handle a host embeds.
//!
//! Member crates stay independently usable (a host that only needs the
//! event bus can depend on `kernel-events` alone); this crate is the
//! convenience facade that sits on top of them rather than every caller
//! assembling the pieces itself.

mod builder;
mod health;
mod kernel;

pub use builder::KernelBuilder;
pub use health::KernelHealth;
pub use kernel::Kernel;

pub use kernel_commands::{CommandHandler, Request};
pub use kernel_core::{
    Clock, ExtensionId, FrozenClock, HandlerResolver, KernelConfig, KernelError, KernelResult,
    ScopedHandler, SingletonResolver, SystemClock, TaskId,
};
pub use kernel_events::{EventHandler, EventOptions, EventTransaction, SubscriptionHandle, TransactionState};
pub use kernel_tasks::{
    ProgressContext, ProgressStep, ProgressUpdate, StateChangeHandle, TaskHandler, TaskOptions,
    TaskPayload, TaskState, TaskStatus, TaskSubscriptionHandle,
};
