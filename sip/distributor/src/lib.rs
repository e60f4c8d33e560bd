//! Request distribution for the tandem SIP core.
//!
//! The [`Distributor`] receives parsed messages from the transport layer,
//! routes them onto per-dialog serializers, identifies the originating
//! endpoint through an ordered identifier chain and applies the
//! authentication gate before handing requests to the registered
//! [`RequestHandler`]s.

mod dialog;
mod distributor;
mod filter;
mod global_headers;
mod identify;
mod unidentified;

pub use dialog::{DialogKey, DialogMap};
pub use distributor::{Distributor, DistributorBuilder, RequestContext, RequestHandler};
pub use filter::{rewrite_outgoing, sanitize_request_uri, validate_incoming};
pub use global_headers::GlobalHeaders;
pub use identify::{
    AuthUsernameIdentifier, EndpointIdentifier, IpIdentifier, LineIdentifier,
    UsernameIdentifier, default_identifiers,
};
pub use unidentified::UnidentifiedTracker;
