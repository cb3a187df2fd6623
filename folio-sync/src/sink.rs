use folio_core::ViewerStore;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::channel::AnnotationSink;
use crate::protocol::AnnotationRecord;

/// Applies remote events to a viewer's store. Replays are harmless.
#[derive(Clone)]
pub struct StoreSink {
    store: ViewerStore,
}

impl StoreSink {
    pub fn new(store: ViewerStore) -> Self {
        Self { store }
    }

    fn upsert(&self, record: AnnotationRecord) {
        let id = record.id();
        let changed = match record {
            AnnotationRecord::Note(note) => self.store.upsert_annotation(note),
            AnnotationRecord::Highlight(record) => self.store.upsert_highlight(record.highlight),
        };
        trace!(%id, changed, "remote record applied");
    }
}

impl AnnotationSink for StoreSink {
    fn created(&self, record: AnnotationRecord) {
        self.upsert(record);
    }

    fn updated(&self, record: AnnotationRecord) {
        self.upsert(record);
    }

    fn deleted(&self, id: Uuid) {
        if !self.store.remove_any(id) {
            debug!(%id, "delete for unknown annotation ignored");
        }
    }
}
