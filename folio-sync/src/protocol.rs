//! JSON wire format of the annotation channel.
//!
//! Every frame is `{"event": ..., "data": ...}`. Records are either notes
//! (`"type": "note"`) or highlights (`"type": "highlight"`).

use folio_core::{Annotation, DocumentId, Highlight};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HighlightTag {
    #[default]
    Highlight,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighlightRecord {
    #[serde(rename = "type", default)]
    pub kind: HighlightTag,
    #[serde(flatten)]
    pub highlight: Highlight,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnnotationRecord {
    Note(Annotation),
    Highlight(HighlightRecord),
}

impl AnnotationRecord {
    pub fn id(&self) -> Uuid {
        match self {
            AnnotationRecord::Note(note) => note.id,
            AnnotationRecord::Highlight(record) => record.highlight.id,
        }
    }

    pub fn page(&self) -> usize {
        match self {
            AnnotationRecord::Note(note) => note.page,
            AnnotationRecord::Highlight(record) => record.highlight.page,
        }
    }
}

impl From<Annotation> for AnnotationRecord {
    fn from(note: Annotation) -> Self {
        AnnotationRecord::Note(note)
    }
}

impl From<Highlight> for AnnotationRecord {
    fn from(highlight: Highlight) -> Self {
        AnnotationRecord::Highlight(HighlightRecord {
            kind: HighlightTag::Highlight,
            highlight,
        })
    }
}

/// Payload of delete events. Extra fields of a full record are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRef {
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum InboundEvent {
    #[serde(rename = "annotation.created")]
    Created(AnnotationRecord),
    #[serde(rename = "annotation.updated")]
    Updated(AnnotationRecord),
    #[serde(rename = "annotation.deleted")]
    Deleted(DeletedRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    #[serde(rename = "annotation.create")]
    Create(AnnotationRecord),
    #[serde(rename = "annotation.update")]
    Update(AnnotationRecord),
    #[serde(rename = "annotation.delete")]
    Delete(DeletedRef),
}

impl InboundEvent {
    pub fn decode(text: &str) -> Result<Self, SyncError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl OutboundEvent {
    pub fn encode(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `{base}/ws/documents/{document}/annotations?token={token}`
pub fn channel_url(base: &str, document: DocumentId, token: &str) -> Result<Url, SyncError> {
    let mut url = Url::parse(&format!(
        "{}/ws/documents/{}/annotations",
        base.trim_end_matches('/'),
        document
    ))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}
