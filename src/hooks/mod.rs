//! Webhook subscriptions and delivery.
//!
//! # Flow
//!
//! ```text
//! mutator ──► EventBus ──► HookDispatcher::run ──► journal
//!                                   │
//!                                   └─► one Delivery per matching subscription
//!                                        └─► Job::DeliverHook ──► deliver() ──► endpoint
//! ```
//!
//! Delivery never feeds back into the transition that produced the event.

pub mod dispatch;
pub mod registry;
pub mod signature;
pub mod transport;

pub use dispatch::{
    DELIVERY_HEADER, DeliveryError, DispatcherConfig, EVENT_HEADER, HookDispatcher,
    SIGNATURE_HEADER,
};
pub use registry::HookRegistry;
pub use signature::{sign, verify_signature};
pub use transport::{
    HookRequest, HookResponse, HookTransport, ReqwestTransport, TransportConfig, TransportError,
};
