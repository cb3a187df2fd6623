use std::convert::TryFrom;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use folio_core::{
    document_id_for_source, is_remote_source, DocumentBackend, DocumentInfo, DocumentMetadata,
    DocumentProvider, RasterRequest, RenderImage, Size, TextRun,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const PDFIUM_PATH_ENV: &str = "FOLIO_PDFIUM_LIBRARY_PATH";

pub struct PdfiumRenderFactory {
    pdfium: Arc<Pdfium>,
    http: reqwest::Client,
}

impl PdfiumRenderFactory {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
            http: reqwest::Client::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Source {
    File(PathBuf),
    Remote(Url),
}

impl Source {
    fn resolve(source: &str) -> Result<Self> {
        if is_remote_source(source) {
            let url = Url::parse(source.trim())
                .with_context(|| format!("invalid document url {source:?}"))?;
            return Ok(Source::Remote(url));
        }
        let path = Path::new(source);
        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {:?}", path))?;
        Ok(Source::File(absolute))
    }
}

#[async_trait]
impl DocumentProvider for PdfiumRenderFactory {
    #[instrument(skip(self))]
    async fn open(&self, source: &str) -> Result<Arc<dyn DocumentBackend>> {
        let resolved = Source::resolve(source)?;
        let document = match &resolved {
            Source::File(path) => self
                .pdfium
                .load_pdf_from_file(path, None)
                .with_context(|| format!("failed to open {:?}", path))?,
            Source::Remote(url) => {
                let bytes = fetch_document(&self.http, url).await?;
                self.pdfium
                    .load_pdf_from_byte_vec(bytes, None)
                    .with_context(|| format!("failed to decode document from {url}"))?
            }
        };
        // SAFETY: the document borrows the bindings owned by `self.pdfium`. A clone of that
        // Arc is stored next to the document in `PdfiumPages`, declared after the document so
        // it drops last, which keeps the bindings alive for as long as the document exists.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };

        let info = build_document_info(&document, source);
        let sizes = page_sizes(&document)?;
        info!(source, pages = info.page_count, "document loaded");

        Ok(Arc::new(PdfiumDocument {
            info,
            sizes,
            pages: Arc::new(PdfiumPages {
                document: Mutex::new(document),
                _pdfium: Arc::clone(&self.pdfium),
            }),
        }))
    }
}

/// Downloads a remote document into memory.
pub async fn fetch_document(client: &reqwest::Client, url: &Url) -> Result<Vec<u8>> {
    debug!(%url, "fetching document");
    let response = client
        .get(url.clone())
        .send()
        .await
        .with_context(|| format!("request for {url} failed"))?
        .error_for_status()
        .with_context(|| format!("document fetch from {url} was rejected"))?;
    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("failed to read document body from {url}"))?;
    Ok(bytes.to_vec())
}

struct PdfiumDocument {
    info: DocumentInfo,
    sizes: Vec<Size>,
    pages: Arc<PdfiumPages>,
}

struct PdfiumPages {
    document: Mutex<PdfDocument<'static>>,
    _pdfium: Arc<Pdfium>,
}

impl PdfiumPages {
    fn rasterize(&self, request: &RasterRequest) -> Result<RenderImage> {
        let document = self.document.lock();
        let page = load_page(&document, request.page)?;

        let (width, height) = request.pixel_size();
        let config = PdfRenderConfig::new().set_target_size(
            i32::try_from(width).context("bitmap too wide")?,
            i32::try_from(height).context("bitmap too tall")?,
        );
        let bitmap = page
            .render_with_config(&config)
            .with_context(|| format!("failed to render page {}", request.page))?;
        let image: image::RgbaImage = bitmap.as_image().to_rgba8();

        Ok(RenderImage {
            width: image.width(),
            height: image.height(),
            pixels: image.into_raw(),
        })
    }

    fn text_runs(&self, page_number: usize) -> Result<Vec<TextRun>> {
        let document = self.document.lock();
        let page = load_page(&document, page_number)?;
        let text = page
            .text()
            .with_context(|| format!("failed to extract text for page {}", page_number))?;

        let runs = text
            .segments()
            .iter()
            .filter_map(|segment| {
                let bounds = segment.bounds();
                run_from_bounds(
                    segment.text(),
                    bounds.left().value as f64,
                    bounds.bottom().value as f64,
                    bounds.right().value as f64,
                    bounds.top().value as f64,
                )
            })
            .collect();
        Ok(runs)
    }
}

#[async_trait]
impl DocumentBackend for PdfiumDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn page_size(&self, page: usize) -> Result<Size> {
        page.checked_sub(1)
            .and_then(|index| self.sizes.get(index))
            .copied()
            .ok_or_else(|| anyhow!("page {} out of range", page))
    }

    #[instrument(skip(self), fields(page = request.page))]
    async fn rasterize(&self, request: RasterRequest) -> Result<RenderImage> {
        let pages = Arc::clone(&self.pages);
        tokio::task::spawn_blocking(move || pages.rasterize(&request))
            .await
            .context("rasterizer task aborted")?
    }

    async fn text_runs(&self, page: usize) -> Result<Vec<TextRun>> {
        let pages = Arc::clone(&self.pages);
        tokio::task::spawn_blocking(move || pages.text_runs(page))
            .await
            .context("text extraction task aborted")?
    }
}

fn load_page<'a>(document: &PdfDocument<'a>, page: usize) -> Result<PdfPage<'a>> {
    let index: PdfPageIndex = page
        .checked_sub(1)
        .and_then(|index| index.try_into().ok())
        .ok_or_else(|| anyhow!("page {} is out of supported range", page))?;
    document
        .pages()
        .get(index)
        .with_context(|| format!("page {} out of range", page))
}

/// Segment bounds are in page space, origin bottom-left. The run transform
/// scales a unit glyph box to the segment height and places it at the
/// segment's baseline.
fn run_from_bounds(text: String, left: f64, bottom: f64, right: f64, top: f64) -> Option<TextRun> {
    let width = right - left;
    let height = top - bottom;
    if text.trim().is_empty() || width <= 0.0 || height <= 0.0 {
        return None;
    }
    Some(TextRun {
        text,
        transform: [height, 0.0, 0.0, height, left, bottom],
        width,
        height,
    })
}

fn page_sizes(document: &PdfDocument<'_>) -> Result<Vec<Size>> {
    document
        .pages()
        .iter()
        .map(|page| {
            let size = Size::new(page.width().value as f64, page.height().value as f64);
            if size.width <= 0.0 || size.height <= 0.0 {
                warn!(?size, "page reports a degenerate size");
            }
            Ok(size)
        })
        .collect()
}

fn build_document_info(document: &PdfDocument<'_>, source: &str) -> DocumentInfo {
    let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
    let metadata = document.metadata();

    let title = metadata
        .get(PdfDocumentMetadataTagType::Title)
        .map(|t| t.value().to_owned());
    let author = metadata
        .get(PdfDocumentMetadataTagType::Author)
        .map(|t| t.value().to_owned());

    DocumentInfo {
        id: document_id_for_source(source),
        source: source.to_owned(),
        page_count,
        metadata: DocumentMetadata { title, author },
    }
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    match std::env::var(PDFIUM_PATH_ENV) {
        Ok(path) if !path.is_empty() => match Pdfium::bind_to_library(&path) {
            Ok(bindings) => Some(Pdfium::new(bindings)),
            Err(err) => {
                warn!("failed to load Pdfium from {}={}: {}", PDFIUM_PATH_ENV, path, err);
                None
            }
        },
        _ => None,
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");

    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; set {} or install it ({})",
                PDFIUM_PATH_ENV,
                errors.join(", ")
            ))
        }
    }
}
