//! Events and the bus that carries them from mutators to the dispatcher.

pub mod bus;
pub mod event;

pub use bus::{EventBus, EventReceiver};
pub use event::{CommitRef, Event, EventPayload, TaskRef};
