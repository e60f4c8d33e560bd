//! Line token bindings.
//!
//! An outbound registration in line mode stamps `;line=<token>` into its
//! Contact URI. Incoming requests carrying the token are bound to the
//! registration's endpoint without any other identification.

use parking_lot::RwLock;
use rand::distr::{Alphanumeric, SampleString};
use std::collections::HashMap;

/// Length of a generated line token.
pub const LINE_TOKEN_LEN: usize = 8;

/// What a line token points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineBinding {
    pub registration: String,
    pub endpoint: String,
}

/// All currently allocated line tokens.
#[derive(Default)]
pub struct LineBindings {
    map: RwLock<HashMap<String, LineBinding>>,
}

impl LineBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a token unique across all registrations.
    pub fn allocate(&self, registration: impl Into<String>, endpoint: impl Into<String>) -> String {
        let binding = LineBinding {
            registration: registration.into(),
            endpoint: endpoint.into(),
        };

        let mut map = self.map.write();

        loop {
            let token = Alphanumeric.sample_string(&mut rand::rng(), LINE_TOKEN_LEN);
            if !map.contains_key(&token) {
                map.insert(token.clone(), binding);
                return token;
            }
        }
    }

    pub fn release(&self, token: &str) -> Option<LineBinding> {
        self.map.write().remove(token)
    }

    pub fn lookup(&self, token: &str) -> Option<LineBinding> {
        self.map.read().get(token).cloned()
    }

    /// Release every token owned by `registration`.
    pub fn release_for_registration(&self, registration: &str) {
        self.map
            .write()
            .retain(|_, b| b.registration != registration);
    }
}
