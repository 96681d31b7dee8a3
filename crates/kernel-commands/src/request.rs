//! A request (command/query): a value carrying inputs plus a phantom
//! response type.

/// A value that can be `Send`t through the dispatcher. `Response` names the
/// type the single registered handler is required to return.
pub trait Request: Send + 'static {
    type Response: Send + 'static;
}
