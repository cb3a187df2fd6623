//! Per-page render driver.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::geometry::{effective_ratio, Size, Viewport};
use crate::store::ViewerStore;
use crate::{DocumentBackend, RasterRequest, RenderImage, TextRun};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render of page {page} was cancelled")]
    Cancelled { page: usize },
    #[error("failed to render page {page}")]
    Backend {
        page: usize,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub page: usize,
    pub viewport: Viewport,
    pub device_pixel_ratio: f64,
    pub image: RenderImage,
}

impl RenderedPage {
    /// Layout size of the surface, equal to the viewport size.
    pub fn css_size(&self) -> Size {
        Size::new(self.viewport.width, self.viewport.height)
    }
}

#[derive(Debug)]
pub enum RenderOutcome {
    Rendered(RenderedPage),
    Cancelled,
    Failed,
}

impl RenderOutcome {
    pub fn rendered(&self) -> Option<&RenderedPage> {
        match self {
            RenderOutcome::Rendered(page) => Some(page),
            _ => None,
        }
    }
}

pub struct PageRenderer {
    backend: Arc<dyn DocumentBackend>,
    page: usize,
    natural_size: Size,
    next_render: AtomicU64,
    in_flight: Mutex<Option<(u64, CancellationToken)>>,
}

impl PageRenderer {
    pub fn new(backend: Arc<dyn DocumentBackend>, page: usize) -> Result<Self> {
        let natural_size = backend.page_size(page)?;
        Ok(Self {
            backend,
            page,
            natural_size,
            next_render: AtomicU64::new(0),
            in_flight: Mutex::new(None),
        })
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn natural_size(&self) -> Size {
        self.natural_size
    }

    pub fn viewport(&self, scale: f64) -> Viewport {
        Viewport::new(self.natural_size, scale)
    }

    /// Scale that fits the page to `container_width`, 1.0 when either width
    /// is unusable.
    pub fn fit_width_scale(&self, container_width: f64) -> f64 {
        let usable = |width: f64| width.is_finite() && width > 0.0;
        if !usable(self.natural_size.width) || !usable(container_width) {
            return 1.0;
        }
        container_width / self.natural_size.width
    }

    pub fn is_rendering(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Cancels the in-flight render, if any. Safe to call repeatedly.
    pub fn cancel(&self) {
        if let Some((_, token)) = self.in_flight.lock().take() {
            debug!(page = self.page, "cancelling in-flight render");
            token.cancel();
        }
    }

    /// Renders at the shared scale, bootstrapping it from this page when the
    /// store has none yet. Cancellation and failures are absorbed here.
    #[instrument(skip(self, store), fields(page = self.page))]
    pub async fn render(
        &self,
        store: &ViewerStore,
        container_width: f64,
        device_pixel_ratio: f64,
    ) -> RenderOutcome {
        let scale = match store.snapshot().scale {
            Some(scale) => scale,
            None => store.bootstrap_scale(self.page, self.fit_width_scale(container_width)),
        };

        match self.render_at(scale, device_pixel_ratio).await {
            Ok(page) => RenderOutcome::Rendered(page),
            Err(RenderError::Cancelled { page }) => {
                debug!(page, "render cancelled");
                RenderOutcome::Cancelled
            }
            Err(err) => {
                error!(page = self.page, error = ?err, "page render failed");
                RenderOutcome::Failed
            }
        }
    }

    pub async fn render_at(
        &self,
        scale: f64,
        device_pixel_ratio: f64,
    ) -> Result<RenderedPage, RenderError> {
        let device_pixel_ratio = effective_ratio(device_pixel_ratio);
        let (render_id, token) = self.begin();
        let viewport = self.viewport(scale);
        let request = RasterRequest {
            page: self.page,
            viewport,
            device_pixel_ratio,
        };

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            image = self.backend.rasterize(request) => Some(image),
        };
        self.finish(render_id);

        let image = match result {
            None => return Err(RenderError::Cancelled { page: self.page }),
            Some(_) if token.is_cancelled() => {
                return Err(RenderError::Cancelled { page: self.page })
            }
            Some(image) => image.map_err(|source| RenderError::Backend {
                page: self.page,
                source,
            })?,
        };

        Ok(RenderedPage {
            page: self.page,
            viewport,
            device_pixel_ratio,
            image,
        })
    }

    pub async fn text_runs(&self) -> Result<Vec<TextRun>> {
        self.backend.text_runs(self.page).await
    }

    fn begin(&self) -> (u64, CancellationToken) {
        let render_id = self.next_render.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Some((_, previous)) = self.in_flight.lock().replace((render_id, token.clone())) {
            debug!(page = self.page, "superseding in-flight render");
            previous.cancel();
        }
        (render_id, token)
    }

    fn finish(&self, render_id: u64) {
        let mut slot = self.in_flight.lock();
        if matches!(slot.as_ref(), Some((current, _)) if *current == render_id) {
            *slot = None;
        }
    }
}

impl Drop for PageRenderer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityChange {
    Entered,
    Left,
    Unchanged,
}

/// Which pages currently intersect the scroll container.
#[derive(Debug, Default)]
pub struct VisibilityTracker {
    visible: BTreeSet<usize>,
}

impl VisibilityTracker {
    pub fn observe(&mut self, page: usize, intersecting: bool) -> VisibilityChange {
        match (intersecting, self.visible.contains(&page)) {
            (true, false) => {
                self.visible.insert(page);
                VisibilityChange::Entered
            }
            (false, true) => {
                self.visible.remove(&page);
                VisibilityChange::Left
            }
            _ => VisibilityChange::Unchanged,
        }
    }

    pub fn is_visible(&self, page: usize) -> bool {
        self.visible.contains(&page)
    }

    pub fn visible(&self) -> impl Iterator<Item = usize> + '_ {
        self.visible.iter().copied()
    }

    pub fn unobserve(&mut self, page: usize) {
        self.visible.remove(&page);
    }
}
