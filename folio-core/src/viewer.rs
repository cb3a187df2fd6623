//! Multi-page orchestration around one shared [`ViewerStore`].

use std::sync::Arc;

use anyhow::Result;
use image::RgbaImage;
use tracing::{debug, info, instrument, warn};

use crate::annotation_layer::{AnnotationLayer, ClickResult};
use crate::config::{RenderMode, ViewerConfig};
use crate::context_menu::{Clipboard, ContextMenuController, GestureResult, MenuAction, MenuOutcome};
use crate::geometry::Point;
use crate::highlight_layer::HighlightLayer;
use crate::render::{PageRenderer, RenderOutcome, RenderedPage, VisibilityChange, VisibilityTracker};
use crate::selection::{PointerButton, SelectionEngine};
use crate::store::{ViewerState, ViewerStore};
use crate::text_layer::TextLayer;
use crate::{
    Annotation, DocumentBackend, DocumentInfo, Highlight, PersistedViewState, StateStore, Tool,
};

#[derive(Debug, Clone, Copy)]
pub enum ViewerCommand {
    NextPage { count: usize },
    PrevPage { count: usize },
    GoToPage { page: usize },
    ZoomIn,
    ZoomOut,
    SetScale { scale: f64 },
    SetTool { tool: Tool },
    ToggleAnnotations,
}

/// Everything one page owns: its renderer and its stack of layers.
pub struct PageView {
    renderer: Arc<PageRenderer>,
    pub text: TextLayer,
    pub selection: SelectionEngine,
    pub highlights: HighlightLayer,
    pub annotations: AnnotationLayer,
    pub context_menu: ContextMenuController,
    rendered: Option<RenderedPage>,
}

impl PageView {
    fn new(renderer: PageRenderer, config: &ViewerConfig) -> Self {
        let page = renderer.page();
        Self {
            renderer: Arc::new(renderer),
            text: TextLayer::new(page),
            selection: SelectionEngine::new(page, config.min_selection_size),
            highlights: HighlightLayer::new(page, config.highlight_color),
            annotations: AnnotationLayer::new(page),
            context_menu: ContextMenuController::new(
                page,
                config.menu_width,
                config.note_input_width,
            ),
            rendered: None,
        }
    }

    pub fn page(&self) -> usize {
        self.renderer.page()
    }

    pub fn renderer(&self) -> Arc<PageRenderer> {
        Arc::clone(&self.renderer)
    }

    pub fn rendered(&self) -> Option<&RenderedPage> {
        self.rendered.as_ref()
    }

    /// Highlight overlay sized to the rendered bitmap.
    pub fn highlight_overlay(&mut self, state: &ViewerState) -> Option<RgbaImage> {
        let rendered = self.rendered.as_ref()?;
        let mut overlay = RgbaImage::new(rendered.image.width, rendered.image.height);
        self.highlights
            .draw(state, rendered.device_pixel_ratio, &mut overlay);
        Some(overlay)
    }
}

pub struct Viewer {
    info: DocumentInfo,
    store: ViewerStore,
    pages: Vec<PageView>,
    visibility: VisibilityTracker,
    config: ViewerConfig,
    state_store: Arc<dyn StateStore>,
    explicit_zoom: Option<f64>,
}

impl Viewer {
    #[instrument(skip_all, fields(source = %backend.info().source))]
    pub fn open(
        backend: Arc<dyn DocumentBackend>,
        config: ViewerConfig,
        state_store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        config.validate()?;
        let info = backend.info().clone();
        let pages = (1..=info.page_count)
            .map(|page| PageRenderer::new(Arc::clone(&backend), page).map(|r| PageView::new(r, &config)))
            .collect::<Result<Vec<_>>>()?;

        let persisted = state_store.load(&info)?.unwrap_or_default();
        let zoom = persisted
            .zoom
            .filter(|zoom| zoom.is_finite() && *zoom > 0.0)
            .map(|zoom| zoom.clamp(config.min_scale, config.max_scale));
        let store = ViewerStore::new(ViewerState {
            page_count: info.page_count,
            scale: zoom,
            tool: persisted.tool,
            show_annotations: persisted.show_annotations,
            current_page: persisted.current_page.clamp(1, info.page_count.max(1)),
            ..ViewerState::default()
        });
        info!(pages = info.page_count, "document opened");

        Ok(Self {
            info,
            store,
            pages,
            visibility: VisibilityTracker::default(),
            config,
            state_store,
            explicit_zoom: zoom,
        })
    }

    pub fn info(&self) -> &DocumentInfo {
        &self.info
    }

    pub fn store(&self) -> &ViewerStore {
        &self.store
    }

    pub fn state(&self) -> Arc<ViewerState> {
        self.store.snapshot()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page(&self, page: usize) -> Option<&PageView> {
        page.checked_sub(1).and_then(|idx| self.pages.get(idx))
    }

    pub fn page_mut(&mut self, page: usize) -> Option<&mut PageView> {
        page.checked_sub(1).and_then(|idx| self.pages.get_mut(idx))
    }

    pub fn set_container_width(&mut self, width: f64) {
        if !(width.is_finite() && width > 0.0) {
            warn!(width, "ignoring unusable container width");
            return;
        }
        self.config.container_width = width;
    }

    /// Renders one page and rebuilds its text layer when the viewport changed.
    pub async fn render_page(&mut self, page: usize) -> RenderOutcome {
        let container_width = self.config.container_width;
        let ratio = self.config.device_pixel_ratio;
        let Some(view) = self.page_mut(page) else {
            warn!(page, "render requested for unknown page");
            return RenderOutcome::Failed;
        };
        let renderer = Arc::clone(&view.renderer);
        let outcome = renderer.render(&self.store, container_width, ratio).await;

        if let RenderOutcome::Rendered(rendered) = &outcome {
            let view = &mut self.pages[page - 1];
            if view.text.needs_render(&rendered.viewport) {
                match renderer.text_runs().await {
                    Ok(runs) => view.text.render(runs, rendered.viewport),
                    Err(err) => {
                        warn!(page, error = ?err, "text extraction failed");
                        view.text.clear();
                    }
                }
            }
            view.rendered = Some(rendered.clone());
        }
        outcome
    }

    /// Renders what the mode calls for. Page 1 goes first while no scale
    /// exists so that it bootstraps the scale for the rest.
    pub async fn render_pending(&mut self) -> Vec<(usize, RenderOutcome)> {
        let mut targets: Vec<usize> = match self.config.render_mode {
            RenderMode::Batch => (1..=self.pages.len()).collect(),
            RenderMode::Lazy => self.visibility.visible().collect(),
        };
        if self.store.snapshot().scale.is_none() && !targets.is_empty() && targets[0] != 1 {
            targets.insert(0, 1);
        }

        let mut outcomes = Vec::with_capacity(targets.len());
        for page in targets {
            let stale = match self.page(page) {
                Some(view) => match (&view.rendered, self.store.snapshot().scale) {
                    (Some(rendered), Some(scale)) => rendered.viewport.scale != scale,
                    _ => true,
                },
                None => continue,
            };
            if stale {
                outcomes.push((page, self.render_page(page).await));
            }
        }
        outcomes
    }

    /// Intersection report from the host's scroll container. Pages leaving
    /// the visible set have their in-flight render cancelled.
    pub fn observe_visibility(&mut self, page: usize, intersecting: bool) -> VisibilityChange {
        let change = self.visibility.observe(page, intersecting);
        if change == VisibilityChange::Left {
            if let Some(view) = self.page(page) {
                view.renderer.cancel();
            }
        }
        change
    }

    pub fn apply(&mut self, command: ViewerCommand) {
        match command {
            ViewerCommand::NextPage { count } => {
                let current = self.store.snapshot().current_page;
                self.store.set_current_page(current.saturating_add(count));
            }
            ViewerCommand::PrevPage { count } => {
                let current = self.store.snapshot().current_page;
                self.store.set_current_page(current.saturating_sub(count));
            }
            ViewerCommand::GoToPage { page } => {
                self.store.set_current_page(page);
            }
            ViewerCommand::ZoomIn => self.zoom_by(self.config.zoom_step),
            ViewerCommand::ZoomOut => self.zoom_by(1.0 / self.config.zoom_step),
            ViewerCommand::SetScale { scale } => self.set_zoom(scale),
            ViewerCommand::SetTool { tool } => {
                if self.store.set_tool(tool) {
                    for view in &mut self.pages {
                        view.selection.abort();
                    }
                }
            }
            ViewerCommand::ToggleAnnotations => {
                let show = !self.store.snapshot().show_annotations;
                self.store.set_show_annotations(show);
            }
        }
    }

    fn zoom_by(&mut self, factor: f64) {
        let Some(scale) = self.store.snapshot().scale else {
            debug!("zoom ignored before scale bootstrap");
            return;
        };
        self.set_zoom(scale * factor);
    }

    fn set_zoom(&mut self, scale: f64) {
        let clamped = scale.clamp(self.config.min_scale, self.config.max_scale);
        if self.store.set_scale(clamped) {
            self.explicit_zoom = Some(clamped);
        }
    }

    pub fn pointer_down(&mut self, page: usize, button: PointerButton, local: Point) -> bool {
        let tool = self.store.snapshot().tool;
        let Some(view) = self.page_mut(page) else {
            return false;
        };
        let PageView {
            selection, text, ..
        } = view;
        selection.pointer_down(tool, button, local, text)
    }

    pub fn pointer_move(&mut self, page: usize, local: Point) {
        let state = self.store.snapshot();
        let Some(view) = self.page_mut(page) else {
            return;
        };
        view.selection.pointer_move(local);
        if let Some(viewport) = view.text.viewport().copied() {
            view.annotations.pointer_move(&state, &viewport, local);
        }
    }

    pub fn pointer_up(&mut self, page: usize, local: Point) -> Option<Highlight> {
        let store = self.store.clone();
        let view = self.page_mut(page)?;
        let PageView {
            selection, text, ..
        } = view;
        selection.pointer_up(local, text, &store)
    }

    /// Plain click on the overlay: note pins, delete controls, dismissal.
    pub fn click(&mut self, page: usize, local: Point) -> ClickResult {
        let store = self.store.clone();
        let Some(view) = self.page_mut(page) else {
            return ClickResult::Ignored;
        };
        view.context_menu.click_outside();
        let Some(viewport) = view.text.viewport().copied() else {
            return ClickResult::Ignored;
        };
        view.annotations.click(&store, &viewport, local)
    }

    pub fn context_menu(
        &mut self,
        page: usize,
        client: Point,
        selection: Option<&str>,
        viewport_right: f64,
    ) -> GestureResult {
        let Some(view) = self.page_mut(page) else {
            return GestureResult::Ignored;
        };
        let PageView {
            context_menu, text, ..
        } = view;
        context_menu.on_context_menu(client, selection, text, viewport_right)
    }

    pub fn choose_menu_action(
        &mut self,
        page: usize,
        action: MenuAction,
        clipboard: &mut dyn Clipboard,
    ) -> MenuOutcome {
        match self.page_mut(page) {
            Some(view) => view.context_menu.choose(action, clipboard),
            None => MenuOutcome::Closed,
        }
    }

    pub fn submit_note(&mut self, page: usize, text: &str) -> Option<Annotation> {
        let store = self.store.clone();
        let view = self.page_mut(page)?;
        view.context_menu.set_draft(text);
        view.context_menu.submit_note(&store)
    }

    pub fn delete_highlight(&mut self, id: uuid::Uuid) -> bool {
        let Some(page) = self.store.snapshot().highlight(id).map(|h| h.page) else {
            return false;
        };
        let store = self.store.clone();
        match self.page_mut(page) {
            Some(view) => view.annotations.delete_highlight(&store, id),
            None => store.remove_highlight(id),
        }
    }

    pub fn edit_note(&mut self, id: uuid::Uuid, text: &str) -> Option<Annotation> {
        let page = self.store.snapshot().annotation(id)?.page;
        let store = self.store.clone();
        self.page_mut(page)?.annotations.edit_note(&store, id, text)
    }

    pub fn delete_note(&mut self, id: uuid::Uuid) -> bool {
        let Some(page) = self.store.snapshot().annotation(id).map(|note| note.page) else {
            return false;
        };
        let store = self.store.clone();
        match self.page_mut(page) {
            Some(view) => view.annotations.delete_note(&store, id),
            None => store.remove_annotation(id),
        }
    }

    pub fn view_state(&self) -> PersistedViewState {
        let state = self.store.snapshot();
        PersistedViewState {
            current_page: state.current_page,
            zoom: self.explicit_zoom,
            tool: state.tool,
            show_annotations: state.show_annotations,
        }
    }

    /// Cancels every in-flight render, stops tracking visibility and saves
    /// view preferences.
    pub fn close(&mut self) -> Result<()> {
        for view in &self.pages {
            view.renderer.cancel();
            self.visibility.unobserve(view.page());
        }
        self.state_store.save(&self.info, &self.view_state())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{run_at, FakeBackend};
    use crate::{MemoryStateStore, Size};

    const PAGE: Size = Size::new(400.0, 300.0);

    fn three_runs() -> Vec<crate::TextRun> {
        vec![
            run_at("first", PAGE.height, 12.0, 12.0, 40.0, 10.0),
            run_at("second", PAGE.height, 60.0, 25.0, 30.0, 10.0),
            run_at("third", PAGE.height, 12.0, 200.0, 60.0, 10.0),
        ]
    }

    fn viewer_with(backend: FakeBackend, config: ViewerConfig) -> (Viewer, Arc<MemoryStateStore>) {
        let states = Arc::new(MemoryStateStore::new());
        let viewer = Viewer::open(Arc::new(backend), config, states.clone()).unwrap();
        (viewer, states)
    }

    fn config(container_width: f64) -> ViewerConfig {
        ViewerConfig {
            container_width,
            ..ViewerConfig::default()
        }
    }

    #[tokio::test]
    async fn highlight_create_and_delete_round_trip() {
        let (mut viewer, _) = viewer_with(FakeBackend::new(1, PAGE, three_runs()), config(400.0));
        assert!(viewer.render_page(1).await.rendered().is_some());
        assert_eq!(viewer.state().scale, Some(1.0));

        viewer.apply(ViewerCommand::SetTool {
            tool: Tool::Highlight,
        });
        assert!(viewer.pointer_down(1, PointerButton::Primary, Point::new(10.0, 10.0)));
        viewer.pointer_move(1, Point::new(100.0, 40.0));
        let highlight = viewer.pointer_up(1, Point::new(100.0, 40.0)).unwrap();

        let state = viewer.state();
        assert_eq!(state.highlights.len(), 1);
        assert_eq!(highlight.quads.len(), 2);

        assert!(viewer.delete_highlight(highlight.id));
        assert!(viewer.state().highlights.is_empty());
    }

    #[tokio::test]
    async fn note_lifecycle_at_scale_one_and_a_half() {
        let (mut viewer, _) = viewer_with(FakeBackend::new(1, PAGE, Vec::new()), config(600.0));
        viewer.render_page(1).await;
        assert_eq!(viewer.state().scale, Some(1.5));

        let handled = viewer.context_menu(1, Point::new(50.0, 60.0), None, 1200.0);
        assert_eq!(handled, GestureResult::Handled);
        let pdf_coord = viewer.page(1).unwrap().context_menu.info().unwrap().pdf_coord;
        assert!((pdf_coord.x - 50.0 / 1.5).abs() < 1e-6);
        assert!((pdf_coord.y - (450.0 - 60.0) / 1.5).abs() < 1e-6);

        struct NoClipboard;
        impl Clipboard for NoClipboard {
            fn set_text(&mut self, _text: &str) -> Result<()> {
                anyhow::bail!("no clipboard")
            }
        }
        viewer.choose_menu_action(1, MenuAction::AddNote, &mut NoClipboard);
        let note = viewer.submit_note(1, "remember this").unwrap();

        let state = viewer.state();
        assert_eq!(state.annotations.len(), 1);
        assert_eq!(state.annotations[0].point, pdf_coord);
        assert_eq!(state.annotations[0].text, "remember this");
        assert_eq!(state.annotations[0].id, note.id);

        let edited = viewer.edit_note(note.id, "revised").unwrap();
        assert_eq!(edited.point, pdf_coord);
        assert_eq!(viewer.state().annotations[0].text, "revised");
        assert!(viewer.delete_note(note.id));
        assert!(!viewer.delete_note(note.id));
        assert!(viewer.state().annotations.is_empty());
    }

    #[tokio::test]
    async fn batch_mode_bootstraps_once_from_page_one() {
        let cfg = ViewerConfig {
            render_mode: RenderMode::Batch,
            ..config(800.0)
        };
        let (mut viewer, _) = viewer_with(FakeBackend::new(3, PAGE, Vec::new()), cfg);

        let outcomes = viewer.render_pending().await;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(viewer.state().scale, Some(2.0));
        for (_, outcome) in &outcomes {
            assert_eq!(outcome.rendered().unwrap().viewport.scale, 2.0);
        }

        assert!(viewer.render_pending().await.is_empty());
    }

    #[tokio::test]
    async fn lazy_mode_renders_visible_pages_after_page_one() {
        let (mut viewer, _) = viewer_with(FakeBackend::new(5, PAGE, Vec::new()), config(400.0));
        viewer.observe_visibility(3, true);
        viewer.observe_visibility(4, true);

        let rendered: Vec<usize> = viewer
            .render_pending()
            .await
            .into_iter()
            .map(|(page, _)| page)
            .collect();
        assert_eq!(rendered, vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn zoom_rerenders_and_keeps_annotations() {
        let (mut viewer, _) = viewer_with(FakeBackend::new(1, PAGE, three_runs()), config(400.0));
        viewer.render_page(1).await;
        viewer.store().add_annotation(Annotation::note(1, Point::new(1.0, 1.0), "n"));

        viewer.apply(ViewerCommand::ZoomIn);
        assert_eq!(viewer.state().scale, Some(1.25));
        viewer.apply(ViewerCommand::SetTool { tool: Tool::Select });
        viewer.apply(ViewerCommand::ToggleAnnotations);
        assert!(!viewer.state().show_annotations);
        assert_eq!(viewer.state().annotations.len(), 1);

        let outcome = viewer.render_page(1).await;
        let rendered = outcome.rendered().unwrap();
        assert_eq!(rendered.viewport.scale, 1.25);
        assert_eq!(
            viewer.page(1).unwrap().text.viewport().unwrap().scale,
            1.25
        );

        viewer.apply(ViewerCommand::SetScale { scale: 100.0 });
        assert_eq!(viewer.state().scale, Some(4.0));
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_viewport_cancels_render() {
        let mut backend = FakeBackend::new(2, PAGE, Vec::new());
        backend.delay = Some(Duration::from_millis(100));
        let (mut viewer, _) = viewer_with(backend, config(400.0));
        viewer.store().set_scale(1.0);
        viewer.observe_visibility(2, true);
        let renderer = viewer.page(2).unwrap().renderer();

        let (outcome, _) = tokio::join!(viewer.render_page(2), async {
            tokio::task::yield_now().await;
            renderer.cancel();
        });
        assert!(matches!(outcome, RenderOutcome::Cancelled));
        assert!(viewer.page(2).unwrap().rendered().is_none());
    }

    #[tokio::test]
    async fn view_state_survives_reopen() {
        let states = Arc::new(MemoryStateStore::new());
        let backend: Arc<dyn DocumentBackend> = Arc::new(FakeBackend::new(4, PAGE, Vec::new()));
        {
            let mut viewer =
                Viewer::open(Arc::clone(&backend), config(400.0), states.clone()).unwrap();
            viewer.render_page(1).await;
            viewer.apply(ViewerCommand::GoToPage { page: 3 });
            viewer.apply(ViewerCommand::ZoomOut);
            viewer.close().unwrap();
        }

        let viewer = Viewer::open(backend, config(400.0), states).unwrap();
        let state = viewer.state();
        assert_eq!(state.current_page, 3);
        assert_eq!(state.scale, Some(0.8));
    }

    #[test]
    fn inverted_zoom_bounds_are_rejected_at_open() {
        let states = Arc::new(MemoryStateStore::new());
        let config = ViewerConfig {
            min_scale: 5.0,
            max_scale: 4.0,
            ..ViewerConfig::default()
        };
        let err = Viewer::open(Arc::new(FakeBackend::new(1, PAGE, Vec::new())), config, states)
            .err()
            .expect("open rejects the config");
        assert!(err.to_string().contains("min_scale"));
    }

    #[tokio::test]
    async fn unusable_container_width_is_ignored() {
        let (mut viewer, _) = viewer_with(FakeBackend::new(1, PAGE, Vec::new()), config(800.0));
        viewer.set_container_width(f64::NAN);
        viewer.set_container_width(0.0);

        let outcome = viewer.render_page(1).await;
        assert_eq!(outcome.rendered().unwrap().viewport.scale, 2.0);
        assert_eq!(viewer.state().scale, Some(2.0));

        viewer.apply(ViewerCommand::ZoomIn);
        assert_eq!(viewer.state().scale, Some(2.5));
    }

    #[tokio::test]
    async fn restored_zoom_is_kept_within_bounds() {
        let states = Arc::new(MemoryStateStore::new());
        let backend: Arc<dyn DocumentBackend> = Arc::new(FakeBackend::new(1, PAGE, Vec::new()));
        let saved = PersistedViewState {
            zoom: Some(50.0),
            ..PersistedViewState::default()
        };
        states.save(backend.info(), &saved).unwrap();
        let viewer = Viewer::open(Arc::clone(&backend), config(400.0), states.clone()).unwrap();
        assert_eq!(viewer.state().scale, Some(4.0));

        let saved = PersistedViewState {
            zoom: Some(f64::NAN),
            ..PersistedViewState::default()
        };
        states.save(backend.info(), &saved).unwrap();
        let viewer = Viewer::open(backend, config(400.0), states).unwrap();
        assert_eq!(viewer.state().scale, None);
    }

    #[tokio::test]
    async fn closing_stops_tracking_visible_pages() {
        let (mut viewer, _) = viewer_with(FakeBackend::new(3, PAGE, Vec::new()), config(400.0));
        viewer.observe_visibility(2, true);
        viewer.close().unwrap();
        assert!(viewer.render_pending().await.is_empty());
    }

    #[tokio::test]
    async fn page_navigation_is_clamped() {
        let (mut viewer, _) = viewer_with(FakeBackend::new(3, PAGE, Vec::new()), config(400.0));
        viewer.apply(ViewerCommand::NextPage { count: 10 });
        assert_eq!(viewer.state().current_page, 3);
        viewer.apply(ViewerCommand::PrevPage { count: 1 });
        assert_eq!(viewer.state().current_page, 2);
        viewer.apply(ViewerCommand::PrevPage { count: 5 });
        assert_eq!(viewer.state().current_page, 1);
    }
}
