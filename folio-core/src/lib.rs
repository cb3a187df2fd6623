use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod annotation_layer;
pub mod config;
pub mod context_menu;
pub mod geometry;
pub mod highlight_layer;
mod model;
pub mod render;
pub mod selection;
pub mod store;
pub mod text_layer;
pub mod viewer;

pub use config::{FolioConfig, InvalidSetting, RenderMode, SyncConfig, ViewerConfig};
pub use geometry::{Matrix, Point, Rect, Size, Viewport};
pub use model::{
    Annotation, AnnotationId, AnnotationKind, ContextInfo, Highlight, HighlightId, Quad, TextRun,
    Tool,
};
pub use store::{ViewerState, ViewerStore};
pub use viewer::{Viewer, ViewerCommand};

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f1d7c62-4b0e-5e8a-9a51-c2d8e07b4f19").expect("valid namespace UUID")
});

/// Stable id for a document source. URLs are used verbatim, local paths are
/// resolved to an absolute form first.
pub fn document_id_for_source(source: &str) -> DocumentId {
    let normalized = if is_remote_source(source) {
        source.trim().to_owned()
    } else {
        let path = Path::new(source);
        path.canonicalize()
            .or_else(|_| {
                if path.is_absolute() {
                    Ok(path.to_path_buf())
                } else {
                    std::env::current_dir().map(|cwd| cwd.join(path))
                }
            })
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .into_owned()
    };
    Uuid::new_v5(&DOCUMENT_NAMESPACE, normalized.as_bytes())
}

pub fn is_remote_source(source: &str) -> bool {
    let source = source.trim_start();
    source.starts_with("http://") || source.starts_with("https://")
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub source: String,
    pub page_count: usize,
    pub metadata: DocumentMetadata,
}

#[derive(Debug, Clone, Copy)]
pub struct RasterRequest {
    /// 1-based.
    pub page: usize,
    pub viewport: Viewport,
    pub device_pixel_ratio: f64,
}

impl RasterRequest {
    /// Backing-store dimensions the backend must produce.
    pub fn pixel_size(&self) -> (u32, u32) {
        self.viewport.device_size(self.device_pixel_ratio)
    }
}

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// The page decoder. Pages are addressed 1-based.
#[async_trait::async_trait]
pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn page_size(&self, page: usize) -> Result<Size>;
    async fn rasterize(&self, request: RasterRequest) -> Result<RenderImage>;
    async fn text_runs(&self, page: usize) -> Result<Vec<TextRun>>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, source: &str) -> Result<Arc<dyn DocumentBackend>>;
}

/// View preferences restored when a document is reopened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedViewState {
    pub current_page: usize,
    /// Only set once the user zoomed explicitly; fit-to-width otherwise.
    pub zoom: Option<f64>,
    pub tool: Tool,
    pub show_annotations: bool,
}

impl Default for PersistedViewState {
    fn default() -> Self {
        Self {
            current_page: 1,
            zoom: None,
            tool: Tool::Select,
            show_annotations: true,
        }
    }
}

pub trait StateStore: Send + Sync {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<PersistedViewState>>;
    fn save(&self, doc: &DocumentInfo, state: &PersistedViewState) -> Result<()>;
}

pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn state_path(&self, doc: &DocumentInfo) -> PathBuf {
        self.root.join(format!("{}.json", doc.id))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<PersistedViewState>> {
        let path = self.state_path(doc);
        if !path.exists() {
            return Ok(None);
        }
        let mut file =
            File::open(&path).with_context(|| format!("failed to open state file {:?}", path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let state = serde_json::from_str(&buf)
            .with_context(|| format!("failed to decode state file {:?}", path))?;
        Ok(Some(state))
    }

    fn save(&self, doc: &DocumentInfo, state: &PersistedViewState) -> Result<()> {
        let path = self.state_path(doc);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(state)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp state file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<HashMap<DocumentId, PersistedViewState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<PersistedViewState>> {
        Ok(self.inner.lock().get(&doc.id).cloned())
    }

    fn save(&self, doc: &DocumentInfo, state: &PersistedViewState) -> Result<()> {
        self.inner.lock().insert(doc.id, state.clone());
        Ok(())
    }
}
