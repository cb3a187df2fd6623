//! Shared viewer state.
//!
//! Every layer reads immutable snapshots and writes through [`ViewerStore::update`].
//! Collections are copy-on-write: a mutation always installs a fresh `Arc`,
//! so `Arc::ptr_eq` is enough to tell whether a layer must redraw.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{Annotation, AnnotationId, Highlight, HighlightId, Tool};

#[derive(Debug, Clone, PartialEq)]
pub struct ViewerState {
    pub page_count: usize,
    /// `None` until the first page has computed the fit-to-width scale.
    pub scale: Option<f64>,
    pub tool: Tool,
    pub highlights: Arc<Vec<Highlight>>,
    pub annotations: Arc<Vec<Annotation>>,
    pub show_annotations: bool,
    /// 1-based.
    pub current_page: usize,
}

impl Default for ViewerState {
    fn default() -> Self {
        Self {
            page_count: 0,
            scale: None,
            tool: Tool::Select,
            highlights: Arc::new(Vec::new()),
            annotations: Arc::new(Vec::new()),
            show_annotations: true,
            current_page: 1,
        }
    }
}

impl ViewerState {
    pub fn highlights_on(&self, page: usize) -> impl Iterator<Item = &Highlight> {
        self.highlights.iter().filter(move |h| h.page == page)
    }

    pub fn annotations_on(&self, page: usize) -> impl Iterator<Item = &Annotation> {
        self.annotations.iter().filter(move |a| a.page == page)
    }

    pub fn highlight(&self, id: HighlightId) -> Option<&Highlight> {
        self.highlights.iter().find(|h| h.id == id)
    }

    pub fn annotation(&self, id: AnnotationId) -> Option<&Annotation> {
        self.annotations.iter().find(|a| a.id == id)
    }
}

#[derive(Clone)]
pub struct ViewerStore {
    inner: Arc<watch::Sender<Arc<ViewerState>>>,
}

impl Default for ViewerStore {
    fn default() -> Self {
        Self::new(ViewerState::default())
    }
}

impl ViewerStore {
    pub fn new(initial: ViewerState) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self {
            inner: Arc::new(tx),
        }
    }

    pub fn snapshot(&self) -> Arc<ViewerState> {
        Arc::clone(&self.inner.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ViewerState>> {
        self.inner.subscribe()
    }

    /// The single setter. `mutate` edits a copy of the current state and
    /// returns whether it changed anything; only then is the copy published.
    pub fn update<F>(&self, mutate: F) -> bool
    where
        F: FnOnce(&mut ViewerState) -> bool,
    {
        self.inner.send_if_modified(|current| {
            let mut next = ViewerState::clone(&**current);
            if mutate(&mut next) {
                *current = Arc::new(next);
                true
            } else {
                false
            }
        })
    }

    /// Records the fit-to-width scale unless one is already set, and returns
    /// the authoritative value either way.
    /// Unusable computed values record 1.0 instead.
    pub fn bootstrap_scale(&self, page: usize, computed: f64) -> f64 {
        let computed = if computed.is_finite() && computed > 0.0 {
            computed
        } else {
            warn!(page, scale = computed, "unusable bootstrap scale, using 1.0");
            1.0
        };
        let mut authoritative = computed;
        self.update(|state| match state.scale {
            Some(existing) => {
                authoritative = existing;
                false
            }
            None => {
                debug!(page, scale = computed, "bootstrapped document scale");
                state.scale = Some(computed);
                true
            }
        });
        authoritative
    }

    pub fn set_scale(&self, scale: f64) -> bool {
        if !scale.is_finite() || scale <= 0.0 {
            return false;
        }
        self.update(|state| {
            if state.scale == Some(scale) {
                return false;
            }
            state.scale = Some(scale);
            true
        })
    }

    pub fn set_page_count(&self, page_count: usize) -> bool {
        self.update(|state| {
            if state.page_count == page_count {
                return false;
            }
            state.page_count = page_count;
            state.current_page = state.current_page.clamp(1, page_count.max(1));
            true
        })
    }

    pub fn set_current_page(&self, page: usize) -> bool {
        self.update(|state| {
            let next = page.clamp(1, state.page_count.max(1));
            if next == state.current_page {
                return false;
            }
            state.current_page = next;
            true
        })
    }

    pub fn set_tool(&self, tool: Tool) -> bool {
        self.update(|state| {
            if state.tool == tool {
                return false;
            }
            state.tool = tool;
            true
        })
    }

    pub fn set_show_annotations(&self, show: bool) -> bool {
        self.update(|state| {
            if state.show_annotations == show {
                return false;
            }
            state.show_annotations = show;
            true
        })
    }

    pub fn add_highlight(&self, highlight: Highlight) -> bool {
        self.upsert_highlight(highlight)
    }

    /// Inserts, or replaces the highlight with the same id.
    pub fn upsert_highlight(&self, highlight: Highlight) -> bool {
        self.update(|state| {
            let mut next: Vec<Highlight> = state.highlights.as_ref().clone();
            match next.iter_mut().find(|h| h.id == highlight.id) {
                Some(existing) if *existing == highlight => return false,
                Some(existing) => *existing = highlight,
                None => next.push(highlight),
            }
            state.highlights = Arc::new(next);
            true
        })
    }

    pub fn remove_highlight(&self, id: HighlightId) -> bool {
        self.update(|state| {
            if !state.highlights.iter().any(|h| h.id == id) {
                return false;
            }
            let next = state
                .highlights
                .iter()
                .filter(|h| h.id != id)
                .cloned()
                .collect();
            state.highlights = Arc::new(next);
            true
        })
    }

    pub fn add_annotation(&self, annotation: Annotation) -> bool {
        self.upsert_annotation(annotation)
    }

    pub fn upsert_annotation(&self, annotation: Annotation) -> bool {
        self.update(|state| {
            let mut next: Vec<Annotation> = state.annotations.as_ref().clone();
            match next.iter_mut().find(|a| a.id == annotation.id) {
                Some(existing) if *existing == annotation => return false,
                Some(existing) => *existing = annotation,
                None => next.push(annotation),
            }
            state.annotations = Arc::new(next);
            true
        })
    }

    pub fn set_annotation_text(&self, id: AnnotationId, text: &str) -> Option<Annotation> {
        let current = self.snapshot().annotation(id).cloned()?;
        let updated = Annotation {
            text: text.to_owned(),
            ..current
        };
        self.upsert_annotation(updated.clone());
        Some(updated)
    }

    pub fn remove_annotation(&self, id: AnnotationId) -> bool {
        self.update(|state| {
            if !state.annotations.iter().any(|a| a.id == id) {
                return false;
            }
            let next = state
                .annotations
                .iter()
                .filter(|a| a.id != id)
                .cloned()
                .collect();
            state.annotations = Arc::new(next);
            true
        })
    }

    /// Removes a highlight or a note, whichever carries `id`.
    pub fn remove_any(&self, id: uuid::Uuid) -> bool {
        self.remove_highlight(id) || self.remove_annotation(id)
    }
}
