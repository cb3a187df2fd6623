//! Invisible, selectable text aligned with the rendered bitmap.

use crate::geometry::{Point, Rect, Viewport};
use crate::TextRun;

/// Stacking order of the per-page layers, bottom to top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Layer {
    Canvas = 0,
    Text = 1,
    Highlights = 2,
    Annotations = 3,
}

impl Layer {
    pub fn z_index(self) -> i32 {
        self as i32
    }
}

/// One positioned, transparent text element.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub text: String,
    pub rect: Rect,
    pub font_size: f64,
    pub z_index: i32,
}

#[derive(Debug, Default)]
pub struct TextLayer {
    page: usize,
    viewport: Option<Viewport>,
    runs: Vec<TextRun>,
    spans: Vec<TextSpan>,
    /// Position of the layer's top-left corner in client coordinates.
    client_origin: Point,
}

impl TextLayer {
    pub fn new(page: usize) -> Self {
        Self {
            page,
            ..Self::default()
        }
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn viewport(&self) -> Option<&Viewport> {
        self.viewport.as_ref()
    }

    pub fn runs(&self) -> &[TextRun] {
        &self.runs
    }

    pub fn spans(&self) -> &[TextSpan] {
        &self.spans
    }

    pub fn needs_render(&self, viewport: &Viewport) -> bool {
        self.viewport.as_ref() != Some(viewport)
    }

    /// Clears and rebuilds every span for the given runs and viewport.
    pub fn render(&mut self, runs: Vec<TextRun>, viewport: Viewport) {
        self.spans.clear();
        self.spans.extend(
            runs.iter()
                .filter(|run| !run.text.trim().is_empty())
                .map(|run| TextSpan {
                    text: run.text.clone(),
                    rect: viewport.project_run(run),
                    font_size: font_size(run, viewport.scale),
                    z_index: Layer::Text.z_index(),
                }),
        );
        self.runs = runs;
        self.viewport = Some(viewport);
    }

    pub fn clear(&mut self) {
        self.spans.clear();
        self.runs.clear();
        self.viewport = None;
    }

    pub fn set_client_origin(&mut self, origin: Point) {
        self.client_origin = origin;
    }

    pub fn client_origin(&self) -> Point {
        self.client_origin
    }

    /// Layer box in client coordinates; empty until rendered.
    pub fn client_bounds(&self) -> Rect {
        self.viewport
            .map(|v| v.bounds())
            .unwrap_or_default()
            .translated(self.client_origin.x, self.client_origin.y)
    }

    /// Converts a client position into layer-local viewport coordinates.
    pub fn to_local(&self, client: Point) -> Point {
        Point::new(client.x - self.client_origin.x, client.y - self.client_origin.y)
    }

    pub fn span_at(&self, local: Point) -> Option<&TextSpan> {
        self.spans.iter().find(|span| span.rect.contains(local))
    }
}

fn font_size(run: &TextRun, scale: f64) -> f64 {
    let [_, _, c, d, _, _] = run.transform;
    let from_matrix = c.hypot(d);
    let unscaled = if from_matrix > 0.0 { from_matrix } else { run.height };
    unscaled * scale
}
