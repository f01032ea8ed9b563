//! Event bus for workflow lifecycle notifications.
//!
//! Provides a synchronous `EventBus` that invokes subscriber callbacks on the
//! publisher's call stack, in registration order.

pub mod bus;

pub use bus::{EventBus, EventHandler};
