//! Dialog to serializer stickiness.
//!
//! Once a dialog has been assigned a serializer, every later message of
//! that dialog is processed on it, preserving arrival order. Transactions
//! remember the serializer that sent their request so out-of-dialog
//! responses come back home too.

use parking_lot::Mutex;
use rsip::prelude::*;
use std::collections::HashMap;

use tandem_core::serializer::Serializer;

/// Identifies a dialog from this side's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogKey {
    pub call_id: String,
    /// Tag assigned by us (To-tag of incoming requests).
    pub local_tag: String,
    /// Tag assigned by the peer (From-tag of incoming requests).
    pub remote_tag: String,
}

impl DialogKey {
    /// Key of an incoming request, `None` while the dialog is half
    /// established (no To-tag yet).
    pub fn of_request(request: &rsip::Request) -> Option<DialogKey> {
        let call_id = request.call_id_header().ok()?.value().to_string();
        let to = request.to_header().ok()?.typed().ok()?;
        let from = request.from_header().ok()?.typed().ok()?;

        let local_tag = to.tag()?.value().to_string();
        let remote_tag = from.tag()?.value().to_string();

        Some(DialogKey {
            call_id,
            local_tag,
            remote_tag,
        })
    }
}

#[derive(Default)]
struct DialogMapInner {
    dialogs: HashMap<DialogKey, Serializer>,
    /// Via branch of transaction-creating requests, for tagless CANCEL
    /// matching.
    transactions: HashMap<String, (Serializer, Option<DialogKey>)>,
}

/// All known dialogs and their serializers.
#[derive(Default)]
pub struct DialogMap {
    inner: Mutex<DialogMapInner>,
}

impl DialogMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `dialog` to `serializer`. The first binding wins; later calls
    /// return the existing serializer.
    pub fn assign(&self, dialog: DialogKey, serializer: Serializer) -> Serializer {
        self.inner
            .lock()
            .dialogs
            .entry(dialog)
            .or_insert(serializer)
            .clone()
    }

    pub fn remove(&self, dialog: &DialogKey) {
        self.inner.lock().dialogs.remove(dialog);
    }

    pub fn lookup(&self, dialog: &DialogKey) -> Option<Serializer> {
        self.inner.lock().dialogs.get(dialog).cloned()
    }

    /// Remember which serializer handles the transaction identified by
    /// `branch`.
    pub fn stamp_transaction(
        &self,
        branch: String,
        serializer: Serializer,
        dialog: Option<DialogKey>,
    ) {
        self.inner
            .lock()
            .transactions
            .insert(branch, (serializer, dialog));
    }

    pub fn transaction(&self, branch: &str) -> Option<(Serializer, Option<DialogKey>)> {
        self.inner.lock().transactions.get(branch).cloned()
    }

    pub fn forget_transaction(&self, branch: &str) {
        self.inner.lock().transactions.remove(branch);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().dialogs.is_empty()
    }
}
