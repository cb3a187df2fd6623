//! Drag-to-highlight gesture handling.

use tracing::{debug, trace};

use crate::geometry::{Point, Rect, Viewport};
use crate::store::ViewerStore;
use crate::text_layer::TextLayer;
use crate::{Highlight, Quad, TextRun, Tool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerButton {
    Primary,
    Secondary,
    Middle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DragState {
    Idle,
    Dragging,
}

#[derive(Debug)]
pub struct SelectionEngine {
    page: usize,
    min_size: f64,
    state: DragState,
    origin: Point,
    current: Point,
}

impl SelectionEngine {
    pub fn new(page: usize, min_size: f64) -> Self {
        Self {
            page,
            min_size,
            state: DragState::Idle,
            origin: Point::default(),
            current: Point::default(),
        }
    }

    pub fn is_dragging(&self) -> bool {
        self.state == DragState::Dragging
    }

    /// Rubber-band rectangle of the gesture in progress.
    pub fn drag_rect(&self) -> Option<Rect> {
        self.is_dragging()
            .then(|| Rect::from_corners(self.origin, self.current))
    }

    /// Starts a drag; `local` is relative to the text layer.
    pub fn pointer_down(
        &mut self,
        tool: Tool,
        button: PointerButton,
        local: Point,
        layer: &TextLayer,
    ) -> bool {
        if tool != Tool::Highlight || button != PointerButton::Primary {
            return false;
        }
        let Some(viewport) = layer.viewport() else {
            return false;
        };
        if !viewport.bounds().contains(local) {
            return false;
        }
        self.state = DragState::Dragging;
        self.origin = local;
        self.current = local;
        true
    }

    pub fn pointer_move(&mut self, local: Point) {
        if self.is_dragging() {
            self.current = local;
        }
    }

    /// Drops a gesture in progress without producing anything.
    pub fn abort(&mut self) {
        self.state = DragState::Idle;
    }

    /// Finishes the drag and records a highlight when it covered any text.
    pub fn pointer_up(
        &mut self,
        local: Point,
        layer: &TextLayer,
        store: &ViewerStore,
    ) -> Option<Highlight> {
        if !self.is_dragging() {
            return None;
        }
        self.current = local;
        self.state = DragState::Idle;

        let selection = Rect::from_corners(self.origin, self.current);
        if selection.width < self.min_size || selection.height < self.min_size {
            trace!(page = self.page, ?selection, "drag below threshold");
            return None;
        }

        let scale = store.snapshot().scale?;
        let natural = layer.viewport()?.natural_size();
        let viewport = Viewport::new(natural, scale);

        let quads = intersecting_quads(layer.runs(), &viewport, &selection);
        if quads.is_empty() {
            trace!(page = self.page, "drag covered no text");
            return None;
        }

        let highlight = Highlight::new(self.page, quads);
        debug!(page = self.page, id = %highlight.id, quads = highlight.quads.len(), "highlight created");
        store.add_highlight(highlight.clone());
        Some(highlight)
    }
}

/// Unscaled quads of every run whose projected box overlaps `selection`.
pub fn intersecting_quads(runs: &[TextRun], viewport: &Viewport, selection: &Rect) -> Vec<Quad> {
    intersecting_runs(runs, viewport, selection)
        .map(|(_, rect)| viewport.unscale(&rect))
        .collect()
}

/// Text of every run overlapping `selection`, in reading order of the runs.
pub fn selected_text(runs: &[TextRun], viewport: &Viewport, selection: &Rect) -> String {
    intersecting_runs(runs, viewport, selection)
        .map(|(run, _)| run.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

fn intersecting_runs<'a>(
    runs: &'a [TextRun],
    viewport: &'a Viewport,
    selection: &'a Rect,
) -> impl Iterator<Item = (&'a TextRun, Rect)> + 'a {
    runs.iter()
        .map(move |run| (run, viewport.project_run(run)))
        .filter(move |(_, rect)| {
            rect.left < selection.right()
                && rect.right() > selection.left
                && rect.top < selection.bottom()
                && rect.bottom() > selection.top
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::run_at;
    use crate::Size;

    const PAGE: Size = Size::new(300.0, 200.0);

    fn layer_with(runs: Vec<TextRun>, scale: f64) -> TextLayer {
        let mut layer = TextLayer::new(1);
        layer.render(runs, Viewport::new(PAGE, scale));
        layer
    }

    fn store_at(scale: f64) -> ViewerStore {
        let store = ViewerStore::default();
        store.set_scale(scale);
        store.set_tool(Tool::Highlight);
        store
    }

    fn drag(
        engine: &mut SelectionEngine,
        layer: &TextLayer,
        store: &ViewerStore,
        from: (f64, f64),
        to: (f64, f64),
    ) -> Option<Highlight> {
        let tool = store.snapshot().tool;
        engine.pointer_down(tool, PointerButton::Primary, Point::new(from.0, from.1), layer);
        engine.pointer_move(Point::new(to.0, to.1));
        engine.pointer_up(Point::new(to.0, to.1), layer, store)
    }

    #[test]
    fn drag_covering_one_run_yields_only_that_run() {
        let runs = vec![
            run_at("A", PAGE.height, 10.0, 10.0, 50.0, 10.0),
            run_at("B", PAGE.height, 10.0, 60.0, 50.0, 10.0),
        ];
        let layer = layer_with(runs, 1.0);
        let store = store_at(1.0);
        let mut engine = SelectionEngine::new(1, 5.0);

        let highlight = drag(&mut engine, &layer, &store, (10.0, 10.0), (60.0, 20.0)).unwrap();

        assert_eq!(
            highlight.quads,
            vec![Quad {
                x: 10.0,
                y: 10.0,
                w: 50.0,
                h: 10.0
            }]
        );
        assert_eq!(store.snapshot().highlights.len(), 1);
    }

    #[test]
    fn quads_are_stored_without_scale() {
        let runs = vec![run_at("A", PAGE.height, 10.0, 10.0, 50.0, 10.0)];
        let layer = layer_with(runs, 2.0);
        let store = store_at(2.0);
        let mut engine = SelectionEngine::new(1, 5.0);

        let highlight = drag(&mut engine, &layer, &store, (0.0, 0.0), (200.0, 100.0)).unwrap();
        assert_eq!(
            highlight.quads[0],
            Quad {
                x: 10.0,
                y: 10.0,
                w: 50.0,
                h: 10.0
            }
        );
    }

    #[test]
    fn small_drags_are_ignored() {
        let runs = vec![run_at("A", PAGE.height, 10.0, 10.0, 50.0, 10.0)];
        let layer = layer_with(runs, 1.0);
        let store = store_at(1.0);
        let mut engine = SelectionEngine::new(1, 5.0);

        assert!(drag(&mut engine, &layer, &store, (10.0, 10.0), (14.0, 40.0)).is_none());
        assert!(drag(&mut engine, &layer, &store, (10.0, 10.0), (60.0, 14.9)).is_none());
        assert!(store.snapshot().highlights.is_empty());
        assert!(!engine.is_dragging());
    }

    #[test]
    fn drag_over_empty_area_creates_nothing() {
        let runs = vec![run_at("A", PAGE.height, 10.0, 10.0, 50.0, 10.0)];
        let layer = layer_with(runs, 1.0);
        let store = store_at(1.0);
        let mut engine = SelectionEngine::new(1, 5.0);

        assert!(drag(&mut engine, &layer, &store, (100.0, 100.0), (200.0, 150.0)).is_none());
        assert!(store.snapshot().highlights.is_empty());
    }

    #[test]
    fn gesture_requires_highlight_tool_and_primary_button() {
        let layer = layer_with(vec![run_at("A", PAGE.height, 10.0, 10.0, 50.0, 10.0)], 1.0);
        let mut engine = SelectionEngine::new(1, 5.0);
        assert!(!engine.pointer_down(
            Tool::Select,
            PointerButton::Primary,
            Point::new(10.0, 10.0),
            &layer
        ));
        assert!(!engine.pointer_down(
            Tool::Highlight,
            PointerButton::Secondary,
            Point::new(10.0, 10.0),
            &layer
        ));
        assert!(!engine.pointer_down(
            Tool::Highlight,
            PointerButton::Primary,
            Point::new(-5.0, 10.0),
            &layer
        ));
        assert!(engine.pointer_down(
            Tool::Highlight,
            PointerButton::Primary,
            Point::new(10.0, 10.0),
            &layer
        ));
        assert!(engine.drag_rect().is_some());
    }

    #[test]
    fn missing_scale_is_a_no_op() {
        let layer = layer_with(vec![run_at("A", PAGE.height, 10.0, 10.0, 50.0, 10.0)], 1.0);
        let store = ViewerStore::default();
        let mut engine = SelectionEngine::new(1, 5.0);
        engine.pointer_down(Tool::Highlight, PointerButton::Primary, Point::new(0.0, 0.0), &layer);
        assert!(engine
            .pointer_up(Point::new(100.0, 100.0), &layer, &store)
            .is_none());
        assert!(store.snapshot().highlights.is_empty());
    }

    #[test]
    fn selected_text_joins_overlapping_runs() {
        let runs = vec![
            run_at("hello", PAGE.height, 10.0, 10.0, 40.0, 10.0),
            run_at("world", PAGE.height, 55.0, 10.0, 40.0, 10.0),
            run_at("later", PAGE.height, 10.0, 100.0, 40.0, 10.0),
        ];
        let viewport = Viewport::new(PAGE, 1.0);
        let text = selected_text(&runs, &viewport, &Rect::new(0.0, 0.0, 120.0, 30.0));
        assert_eq!(text, "hello world");
    }
}
