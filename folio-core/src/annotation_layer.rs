//! Note pins and the highlight delete affordance.

use std::collections::HashSet;

use tracing::debug;

use crate::geometry::{Point, Rect, Viewport};
use crate::store::{ViewerState, ViewerStore};
use crate::{Annotation, AnnotationId, HighlightId};

pub const NOTE_INDICATOR_SIZE: f64 = 24.0;
pub const NOTE_PANEL_SIZE: (f64, f64) = (220.0, 120.0);
pub const DELETE_CONTROL_SIZE: f64 = 16.0;

/// Pin drawn for a note, centred on the note's projected point.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteIndicator {
    pub id: AnnotationId,
    pub center: Point,
    pub rect: Rect,
    pub open: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HighlightBox {
    pub id: HighlightId,
    pub rect: Rect,
    /// Present while the pointer hovers this box.
    pub delete_control: Option<Rect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitTarget {
    /// Events fall through to the text layer below.
    Passthrough,
    Note(AnnotationId),
    NotePanel(AnnotationId),
    Highlight(HighlightId),
    DeleteControl(HighlightId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickResult {
    Opened(AnnotationId),
    Closed(AnnotationId),
    Deleted(HighlightId),
    Ignored,
}

#[derive(Debug)]
pub struct AnnotationLayer {
    page: usize,
    open: HashSet<AnnotationId>,
    hovered: Option<HighlightId>,
}

impl AnnotationLayer {
    pub fn new(page: usize) -> Self {
        Self {
            page,
            open: HashSet::new(),
            hovered: None,
        }
    }

    pub fn is_open(&self, id: AnnotationId) -> bool {
        self.open.contains(&id)
    }

    pub fn hovered(&self) -> Option<HighlightId> {
        self.hovered
    }

    /// Recomputed from the note's document point on every call.
    pub fn indicators(&self, state: &ViewerState, viewport: &Viewport) -> Vec<NoteIndicator> {
        if !state.show_annotations {
            return Vec::new();
        }
        state
            .annotations_on(self.page)
            .map(|note| {
                let center = viewport.point_to_viewport(note.point);
                NoteIndicator {
                    id: note.id,
                    center,
                    rect: centered(center, NOTE_INDICATOR_SIZE, NOTE_INDICATOR_SIZE),
                    open: self.open.contains(&note.id),
                }
            })
            .collect()
    }

    /// Panels of the notes currently revealed, anchored below their pins.
    pub fn open_panels<'a>(
        &self,
        state: &'a ViewerState,
        viewport: &Viewport,
    ) -> Vec<(&'a Annotation, Rect)> {
        if !state.show_annotations {
            return Vec::new();
        }
        state
            .annotations_on(self.page)
            .filter(|note| self.open.contains(&note.id))
            .map(|note| (note, panel_rect(viewport.point_to_viewport(note.point))))
            .collect()
    }

    pub fn highlight_boxes(&self, state: &ViewerState) -> Vec<HighlightBox> {
        let Some(scale) = state.scale else {
            return Vec::new();
        };
        state
            .highlights_on(self.page)
            .filter_map(|h| {
                let rect = h.bounding_box(scale)?;
                let delete_control = (self.hovered == Some(h.id)).then(|| delete_control(&rect));
                Some(HighlightBox {
                    id: h.id,
                    rect,
                    delete_control,
                })
            })
            .collect()
    }

    /// What sits under `local`; everything outside pins, open panels and
    /// highlight boxes lets the pointer through.
    pub fn hit_test(&self, state: &ViewerState, viewport: &Viewport, local: Point) -> HitTarget {
        for (note, rect) in self.open_panels(state, viewport) {
            if rect.contains(local) {
                return HitTarget::NotePanel(note.id);
            }
        }
        for indicator in self.indicators(state, viewport) {
            if indicator.rect.contains(local) {
                return HitTarget::Note(indicator.id);
            }
        }
        let Some(scale) = state.scale else {
            return HitTarget::Passthrough;
        };
        for highlight in state.highlights_on(self.page) {
            let Some(rect) = highlight.bounding_box(scale) else {
                continue;
            };
            if self.hovered == Some(highlight.id) && delete_control(&rect).contains(local) {
                return HitTarget::DeleteControl(highlight.id);
            }
            if rect.contains(local) {
                return HitTarget::Highlight(highlight.id);
            }
        }
        HitTarget::Passthrough
    }

    pub fn pointer_move(&mut self, state: &ViewerState, viewport: &Viewport, local: Point) {
        self.hovered = match self.hit_test(state, viewport, local) {
            HitTarget::Highlight(id) | HitTarget::DeleteControl(id) => Some(id),
            _ => None,
        };
    }

    pub fn click(
        &mut self,
        store: &ViewerStore,
        viewport: &Viewport,
        local: Point,
    ) -> ClickResult {
        let state = store.snapshot();
        match self.hit_test(&state, viewport, local) {
            HitTarget::Note(id) => {
                if self.open.remove(&id) {
                    ClickResult::Closed(id)
                } else {
                    self.open.insert(id);
                    ClickResult::Opened(id)
                }
            }
            HitTarget::NotePanel(_) => ClickResult::Ignored,
            HitTarget::DeleteControl(id) => {
                self.delete_highlight(store, id);
                ClickResult::Deleted(id)
            }
            HitTarget::Highlight(_) | HitTarget::Passthrough => {
                self.open.clear();
                ClickResult::Ignored
            }
        }
    }

    pub fn close_note(&mut self, id: AnnotationId) {
        self.open.remove(&id);
    }

    pub fn delete_highlight(&mut self, store: &ViewerStore, id: HighlightId) -> bool {
        if self.hovered == Some(id) {
            self.hovered = None;
        }
        let removed = store.remove_highlight(id);
        if removed {
            debug!(page = self.page, %id, "highlight deleted");
        }
        removed
    }

    pub fn edit_note(&mut self, store: &ViewerStore, id: AnnotationId, text: &str) -> Option<Annotation> {
        store.set_annotation_text(id, text)
    }

    pub fn delete_note(&mut self, store: &ViewerStore, id: AnnotationId) -> bool {
        self.open.remove(&id);
        store.remove_annotation(id)
    }
}

fn centered(center: Point, width: f64, height: f64) -> Rect {
    Rect::new(center.x - width / 2.0, center.y - height / 2.0, width, height)
}

fn panel_rect(anchor: Point) -> Rect {
    let (width, height) = NOTE_PANEL_SIZE;
    Rect::new(
        anchor.x - width / 2.0,
        anchor.y + NOTE_INDICATOR_SIZE / 2.0,
        width,
        height,
    )
}

fn delete_control(highlight: &Rect) -> Rect {
    Rect::new(
        highlight.right() - DELETE_CONTROL_SIZE / 2.0,
        highlight.top - DELETE_CONTROL_SIZE / 2.0,
        DELETE_CONTROL_SIZE,
        DELETE_CONTROL_SIZE,
    )
}
