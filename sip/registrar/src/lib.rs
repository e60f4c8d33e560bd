//! Inbound registrar and availability engine of the tandem SIP core.
//!
//! [`Registrar`] applies REGISTER requests to the location store,
//! [`AvailabilityEngine`] qualifies contacts with OPTIONS probes and feeds
//! per-endpoint state compositors.

mod compositor;
mod location;
mod options;
mod register;

pub use compositor::EndpointCompositor;
pub use location::{BindingSource, Locator};
pub use options::AvailabilityEngine;
pub use register::Registrar;
