use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::{Matrix, Point, Rect};

pub type HighlightId = Uuid;
pub type AnnotationId = Uuid;

/// One shaped run of glyphs as extracted by the decoder, in document space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    pub transform: Matrix,
    pub width: f64,
    pub height: f64,
}

/// Highlighted region in unscaled page units, top-left origin.
///
/// Equal to the viewport rectangle divided by the scale it was captured at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quad {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Quad {
    pub fn to_viewport(&self, scale: f64) -> Rect {
        Rect::new(self.x * scale, self.y * scale, self.w * scale, self.h * scale)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub id: HighlightId,
    pub page: usize,
    pub quads: Vec<Quad>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Highlight {
    pub fn new(page: usize, quads: Vec<Quad>) -> Self {
        Self {
            id: Uuid::new_v4(),
            page,
            quads,
            comment: None,
        }
    }

    /// Union of all quads at the given scale.
    pub fn bounding_box(&self, scale: f64) -> Option<Rect> {
        let mut quads = self.quads.iter();
        let first = quads.next()?.to_viewport(scale);
        Some(quads.fold(first, |acc, quad| acc.union(&quad.to_viewport(scale))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationKind {
    Note,
}

/// Point annotation anchored at a document-space position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: AnnotationId,
    pub page: usize,
    #[serde(rename = "type")]
    pub kind: AnnotationKind,
    pub point: Point,
    pub text: String,
}

impl Annotation {
    pub fn note(page: usize, point: Point, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            page,
            kind: AnnotationKind::Note,
            point,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    #[default]
    Select,
    Highlight,
}

/// Captured at one context-menu invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextInfo {
    pub text: Option<String>,
    pub pdf_coord: Point,
    pub screen_coord: Point,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_serializes_with_type_tag() {
        let note = Annotation::note(2, Point::new(10.0, 20.0), "hello");
        let value = serde_json::to_value(&note).unwrap();
        assert_eq!(value["type"], "note");
        assert_eq!(value["page"], 2);
        assert_eq!(value["point"]["x"], 10.0);
    }

    #[test]
    fn highlight_bounding_box_unions_quads() {
        let highlight = Highlight::new(
            1,
            vec![
                Quad {
                    x: 10.0,
                    y: 10.0,
                    w: 5.0,
                    h: 5.0,
                },
                Quad {
                    x: 20.0,
                    y: 30.0,
                    w: 10.0,
                    h: 2.0,
                },
            ],
        );
        let rect = highlight.bounding_box(2.0).unwrap();
        assert_eq!(rect, Rect::new(20.0, 20.0, 40.0, 44.0));
        assert!(Highlight::new(1, Vec::new()).bounding_box(1.0).is_none());
    }
}
