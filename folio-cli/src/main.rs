use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use folio_core::context_menu::{Clipboard, GestureResult, MenuAction, MenuOutcome};
use folio_core::render::RenderedPage;
use folio_core::selection::{selected_text, PointerButton};
use folio_core::{
    document_id_for_source, DocumentProvider, FileStateStore, FolioConfig, Point, Rect,
    StateStore, Tool, Viewer, ViewerCommand, ViewerStore,
};
use folio_render::PdfiumRenderFactory;
use folio_sync::{
    AnnotationChannel, AnnotationRecord, ChannelStatus, HttpTokenSource, StoreSink, WsConnector,
};
use image::RgbaImage;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(
    name = "folio",
    version,
    about = "Render, select and annotate course PDFs"
)]
struct Args {
    /// Config file to load instead of the platform default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Layout width pages are fitted to
    #[arg(long, global = true)]
    width: Option<f64>,

    /// Device pixel ratio of the backing store
    #[arg(long, global = true)]
    dpr: Option<f64>,

    /// Websocket base of the annotation service
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: CommandKind,
}

#[derive(Debug, Subcommand)]
enum CommandKind {
    /// Render one page to a PNG file
    Render {
        /// Local path or http(s) URL
        source: String,
        #[arg(short, long, default_value_t = 1)]
        page: usize,
        /// Explicit zoom instead of fit-to-width
        #[arg(long)]
        scale: Option<f64>,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print a page's text runs and their on-screen boxes as JSON
    Runs {
        source: String,
        #[arg(short, long, default_value_t = 1)]
        page: usize,
    },
    /// Drag across a page region and record the highlight it produces
    Select {
        source: String,
        #[arg(short, long, default_value_t = 1)]
        page: usize,
        /// Drag start, `X,Y` in viewport pixels
        #[arg(long, value_parser = parse_point)]
        from: Point,
        /// Drag end, `X,Y` in viewport pixels
        #[arg(long, value_parser = parse_point)]
        to: Point,
        /// Copy the selected text to the clipboard
        #[arg(long)]
        copy: bool,
        /// Write the page with the highlight overlay to this PNG
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Send the highlight to the annotation service
        #[arg(long)]
        publish: bool,
    },
    /// Attach a note at a position on a page
    Note {
        source: String,
        #[arg(short, long, default_value_t = 1)]
        page: usize,
        /// `X,Y` in viewport pixels
        #[arg(long, value_parser = parse_point)]
        at: Point,
        text: String,
        #[arg(long)]
        publish: bool,
    },
    /// Follow a document's annotation channel until interrupted
    Watch { source: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("org", "folio", "folio")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = load_config(&args, &project_dirs)?;

    match args.command {
        CommandKind::Render {
            source,
            page,
            scale,
            output,
        } => render(&config, &project_dirs, &source, page, scale, &output).await,
        CommandKind::Runs { source, page } => runs(&config, &project_dirs, &source, page).await,
        CommandKind::Select {
            source,
            page,
            from,
            to,
            copy,
            output,
            publish,
        } => {
            let options = SelectOptions {
                copy,
                output,
                publish,
            };
            select(&config, &project_dirs, &source, page, from, to, options).await
        }
        CommandKind::Note {
            source,
            page,
            at,
            text,
            publish,
        } => note(&config, &project_dirs, &source, page, at, &text, publish).await,
        CommandKind::Watch { source } => watch(&config, &source).await,
    }
}

fn load_config(args: &Args, project_dirs: &ProjectDirs) -> Result<FolioConfig> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| FolioConfig::default_path(project_dirs));
    let mut config = FolioConfig::load_or_default(&path)?;
    if let Some(width) = args.width {
        config.viewer.container_width = width;
    }
    if let Some(dpr) = args.dpr {
        config.viewer.device_pixel_ratio = dpr;
    }
    if let Some(base_url) = &args.base_url {
        config.sync.base_url = base_url.clone();
    }
    config
        .viewer
        .validate()
        .context("invalid viewer settings")?;
    Ok(config)
}

async fn open_viewer(
    config: &FolioConfig,
    project_dirs: &ProjectDirs,
    source: &str,
) -> Result<Viewer> {
    let provider = PdfiumRenderFactory::new()?;
    let backend = provider
        .open(source)
        .await
        .with_context(|| format!("failed to open {source}"))?;
    let state_dir = project_dirs.data_local_dir().join("state");
    let states: Arc<dyn StateStore> = Arc::new(FileStateStore::new(state_dir)?);
    Viewer::open(backend, config.viewer.clone(), states)
}

async fn render_required(viewer: &mut Viewer, page: usize) -> Result<RenderedPage> {
    if page == 0 || page > viewer.page_count() {
        bail!(
            "page {page} out of range (document has {} pages)",
            viewer.page_count()
        );
    }
    viewer
        .render_page(page)
        .await
        .rendered()
        .cloned()
        .ok_or_else(|| anyhow!("page {page} could not be rendered"))
}

async fn render(
    config: &FolioConfig,
    project_dirs: &ProjectDirs,
    source: &str,
    page: usize,
    scale: Option<f64>,
    output: &Path,
) -> Result<()> {
    let mut viewer = open_viewer(config, project_dirs, source).await?;
    if let Some(scale) = scale {
        viewer.apply(ViewerCommand::SetScale { scale });
    }
    let rendered = render_required(&mut viewer, page).await?;
    to_rgba(&rendered)?
        .save(output)
        .with_context(|| format!("failed to write {:?}", output))?;
    info!(page, scale = rendered.viewport.scale, output = %output.display(), "page rendered");
    viewer.close()
}

#[derive(Serialize)]
struct RunRow<'a> {
    text: &'a str,
    left: f64,
    top: f64,
    width: f64,
    height: f64,
    font_size: f64,
}

async fn runs(
    config: &FolioConfig,
    project_dirs: &ProjectDirs,
    source: &str,
    page: usize,
) -> Result<()> {
    let mut viewer = open_viewer(config, project_dirs, source).await?;
    render_required(&mut viewer, page).await?;
    let view = viewer
        .page(page)
        .ok_or_else(|| anyhow!("page {page} out of range"))?;
    let rows: Vec<RunRow<'_>> = view
        .text
        .spans()
        .iter()
        .map(|span| RunRow {
            text: &span.text,
            left: span.rect.left,
            top: span.rect.top,
            width: span.rect.width,
            height: span.rect.height,
            font_size: span.font_size,
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    viewer.close()
}

struct SelectOptions {
    copy: bool,
    output: Option<PathBuf>,
    publish: bool,
}

async fn select(
    config: &FolioConfig,
    project_dirs: &ProjectDirs,
    source: &str,
    page: usize,
    from: Point,
    to: Point,
    options: SelectOptions,
) -> Result<()> {
    let mut viewer = open_viewer(config, project_dirs, source).await?;
    let rendered = render_required(&mut viewer, page).await?;

    viewer.apply(ViewerCommand::SetTool {
        tool: Tool::Highlight,
    });
    if !viewer.pointer_down(page, PointerButton::Primary, from) {
        bail!("selection must start inside page {page}");
    }
    viewer.pointer_move(page, to);
    let Some(highlight) = viewer.pointer_up(page, to) else {
        println!("no text under the selection");
        return viewer.close();
    };

    let text = viewer
        .page(page)
        .map(|view| selected_text(view.text.runs(), &rendered.viewport, &Rect::from_corners(from, to)))
        .unwrap_or_default();
    println!("{}", serde_json::to_string_pretty(&highlight)?);
    println!("{text}");

    if options.copy {
        viewer.context_menu(page, from, Some(&text), f64::INFINITY);
        let mut clipboard = SystemClipboard::default();
        match viewer.choose_menu_action(page, MenuAction::Copy, &mut clipboard) {
            MenuOutcome::Notice(notice) => info!(?notice, "copy finished"),
            other => warn!(?other, "unexpected menu outcome"),
        }
    }

    if let Some(output) = &options.output {
        let state = viewer.state();
        let mut base = to_rgba(&rendered)?;
        if let Some(overlay) = viewer
            .page_mut(page)
            .and_then(|view| view.highlight_overlay(&state))
        {
            image::imageops::overlay(&mut base, &overlay, 0, 0);
        }
        base.save(output)
            .with_context(|| format!("failed to write {:?}", output))?;
    }

    if options.publish {
        publish(config, source, highlight.into()).await?;
    }
    viewer.close()
}

async fn note(
    config: &FolioConfig,
    project_dirs: &ProjectDirs,
    source: &str,
    page: usize,
    at: Point,
    text: &str,
    publish_note: bool,
) -> Result<()> {
    let mut viewer = open_viewer(config, project_dirs, source).await?;
    render_required(&mut viewer, page).await?;

    if viewer.context_menu(page, at, None, f64::INFINITY) == GestureResult::Ignored {
        bail!("{},{} is outside page {page}", at.x, at.y);
    }
    viewer.choose_menu_action(page, MenuAction::AddNote, &mut SystemClipboard::default());
    let annotation = viewer
        .submit_note(page, text)
        .ok_or_else(|| anyhow!("note text must not be empty"))?;
    println!("{}", serde_json::to_string_pretty(&annotation)?);

    if publish_note {
        publish(config, source, annotation.into()).await?;
    }
    viewer.close()
}

fn sync_channel(config: &FolioConfig, store: ViewerStore) -> Result<AnnotationChannel> {
    let tokens = HttpTokenSource::new(&config.sync.token_url())?;
    Ok(AnnotationChannel::new(
        config.sync.clone(),
        Arc::new(WsConnector),
        Arc::new(tokens),
        Arc::new(StoreSink::new(store)),
    ))
}

async fn publish(config: &FolioConfig, source: &str, record: AnnotationRecord) -> Result<()> {
    let mut channel = sync_channel(config, ViewerStore::default())?;
    channel.open(document_id_for_source(source)).await;

    let mut status = channel.subscribe();
    let settled = tokio::time::timeout(
        CONNECT_TIMEOUT,
        status.wait_for(|s| matches!(s, ChannelStatus::Connected | ChannelStatus::Failed)),
    )
    .await
    .map(|result| result.map(|status| *status));
    match settled {
        Ok(Ok(status)) => debug!(?status, "annotation channel settled"),
        Ok(Err(_)) => warn!("annotation channel stopped before connecting"),
        Err(_) => warn!(timeout = ?CONNECT_TIMEOUT, "annotation channel did not connect in time"),
    }

    let sent = channel.create(record);
    channel.close().await;
    if !sent {
        bail!("annotation service unreachable at {}", config.sync.base_url);
    }
    info!("annotation published");
    Ok(())
}

async fn watch(config: &FolioConfig, source: &str) -> Result<()> {
    let store = ViewerStore::default();
    let mut channel = sync_channel(config, store.clone())?;
    let document = document_id_for_source(source);
    let mut status = channel.subscribe();
    let mut state = store.subscribe();
    channel.open(document).await;
    info!(%document, source, "watching annotation channel");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                println!("channel: {current:?}");
                if matches!(current, ChannelStatus::Failed | ChannelStatus::Closed(folio_sync::CloseKind::Clean)) {
                    break;
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                println!(
                    "annotations: {} notes, {} highlights",
                    snapshot.annotations.len(),
                    snapshot.highlights.len()
                );
            }
        }
    }

    channel.close().await;
    Ok(())
}

/// System clipboard, opened on first use.
#[derive(Default)]
struct SystemClipboard {
    inner: Option<arboard::Clipboard>,
}

impl Clipboard for SystemClipboard {
    fn set_text(&mut self, text: &str) -> Result<()> {
        let clipboard = match &mut self.inner {
            Some(clipboard) => clipboard,
            slot @ None => slot.insert(arboard::Clipboard::new().context("clipboard unavailable")?),
        };
        clipboard
            .set_text(text.to_owned())
            .context("failed to write to clipboard")
    }
}

fn to_rgba(rendered: &RenderedPage) -> Result<RgbaImage> {
    let image = &rendered.image;
    RgbaImage::from_raw(image.width, image.height, image.pixels.clone())
        .ok_or_else(|| anyhow!("renderer returned a truncated bitmap"))
}

fn parse_point(raw: &str) -> Result<Point, String> {
    let (x, y) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y but got {raw:?}"))?;
    let x = x.trim().parse::<f64>().map_err(|err| format!("bad X: {err}"))?;
    let y = y.trim().parse::<f64>().map_err(|err| format!("bad Y: {err}"))?;
    Ok(Point::new(x, y))
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "folio.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
