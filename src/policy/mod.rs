//! Client/owner quota policy and request admission.
//!
//! Clients group owners; both carry reservations, limits and FIFO wait
//! queues. See [`AdmissionEngine`] for the admission rules.

mod client;
mod engine;
mod owner;

pub use client::{
    ClientEvent, ClientRegistration, ClientUsage, EventCallback, ExpectedOwners, PolicyKind,
};
pub use engine::{Admission, AdmissionEngine, QueueKind};
pub use owner::{OwnerRegistration, OwnerUsage};

slotmap::new_key_type! {
    /// Generation-checked handle to a request parked on a wait queue.
    pub struct RequestKey;
}
