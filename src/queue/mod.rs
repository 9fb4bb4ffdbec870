//! Queue handlers (spec sections 4.5-4.7): the event queue handler, the
//! work queue handler, and the action dispatcher they both delegate to.

mod action;
mod event;
mod work;

pub use action::{ActionContext, ActionDispatcher, ActionKind};
pub use event::EventQueueHandler;
pub use work::WorkQueueHandler;
