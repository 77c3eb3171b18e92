use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use image::RgbaImage;
use pagedeck_core::{
    document_id_for_bytes, Document, DocumentId, PagedeckConfig, PersistenceGateway, RenderEvent,
    RotateDirection, Session, TransformState,
};
use pagedeck_net::HttpGateway;
use pagedeck_render::PdfiumDecoder;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "pagedeck",
    version,
    about = "per-page PDF raster and transform pipeline"
)]
struct Args {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Print document identity and page count
    Info { file: PathBuf },

    /// Rotate pages and write an edited copy
    Rotate {
        file: PathBuf,

        #[arg(short = 'o', long = "output")]
        output: PathBuf,

        /// 0-based page indices to rotate; every page when omitted
        #[arg(long, value_delimiter = ',')]
        pages: Vec<usize>,

        /// Quarter turns to apply; negative values turn counter-clockwise
        #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
        turns: i32,
    },

    /// Render page thumbnails to PNG files
    Thumbs {
        file: PathBuf,

        #[arg(long = "out-dir")]
        out_dir: PathBuf,
    },

    /// Download a document from the persistence service
    Fetch {
        #[arg(long = "base-url")]
        base_url: String,

        #[arg(long)]
        id: DocumentId,

        #[arg(short = 'o', long = "output")]
        output: PathBuf,
    },

    /// Upload a document to the persistence service
    Push {
        #[arg(long = "base-url")]
        base_url: String,

        file: PathBuf,

        /// Defaults to the content-derived id of the uploaded bytes
        #[arg(long)]
        id: Option<DocumentId>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let project_dirs = ProjectDirs::from("net", "pagedeck", "pagedeck")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = PagedeckConfig::load_or_default(&project_dirs.config_dir().join("pagedeck.toml"));

    match args.command {
        CliCommand::Info { file } => info(&file).await,
        CliCommand::Rotate {
            file,
            output,
            pages,
            turns,
        } => rotate(&file, &output, &pages, turns).await,
        CliCommand::Thumbs { file, out_dir } => thumbs(&config, &file, &out_dir).await,
        CliCommand::Fetch {
            base_url,
            id,
            output,
        } => fetch(&config, &base_url, id, &output).await,
        CliCommand::Push { base_url, file, id } => push(&config, &base_url, &file, id).await,
    }
}

async fn load_document(file: &Path) -> Result<Document> {
    let bytes = fs::read(file).with_context(|| format!("failed to read {:?}", file))?;
    let decoder = PdfiumDecoder::new()?;
    let document = Document::load(&decoder, Bytes::from(bytes))
        .await
        .with_context(|| format!("failed to load {:?}", file))?;
    Ok(document)
}

async fn info(file: &Path) -> Result<()> {
    let document = load_document(file).await?;
    println!("id:         {}", document.id());
    println!("page count: {}", document.page_count());
    Ok(())
}

fn rotation_plan(turns: i32) -> (RotateDirection, u32) {
    let direction = if turns >= 0 {
        RotateDirection::Clockwise
    } else {
        RotateDirection::CounterClockwise
    };
    (direction, turns.unsigned_abs())
}

async fn rotate(file: &Path, output: &Path, pages: &[usize], turns: i32) -> Result<()> {
    let document = load_document(file).await?;

    let mut transform = TransformState::new(document.page_count());
    for &page in pages {
        if page >= document.page_count() {
            bail!(
                "page {page} out of range (document has {} pages)",
                document.page_count()
            );
        }
        transform = transform.toggle_selection(page).0;
    }

    let (direction, count) = rotation_plan(turns);
    for _ in 0..count {
        transform = transform.rotate(direction).0;
    }

    let bytes = pagedeck_export::build(&document, &transform).await?;
    fs::write(output, &bytes).with_context(|| format!("failed to write {:?}", output))?;
    println!(
        "wrote {} pages to {}",
        document.page_count(),
        output.display()
    );
    Ok(())
}

async fn thumbs(config: &PagedeckConfig, file: &Path, out_dir: &Path) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("failed to read {:?}", file))?;
    let decoder = PdfiumDecoder::new()?;

    let mut session = Session::new(config.clone());
    session
        .open_bytes(&decoder, Bytes::from(bytes))
        .await
        .with_context(|| format!("failed to load {:?}", file))?;
    session.wait_idle().await;

    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create output directory {:?}", out_dir))?;

    let page_count = session
        .document()
        .map(Document::page_count)
        .unwrap_or_default();
    let transform = session.transform().context("no document loaded")?;
    let cache = session.cache().context("no raster cache")?;

    let mut written = 0usize;
    for page in 0..page_count {
        let Some(entry) = cache.thumbnail(page, transform.rotation(page)) else {
            warn!(page, "thumbnail missing after render pass");
            continue;
        };
        let image =
            RgbaImage::from_raw(entry.image.width, entry.image.height, entry.image.pixels)
                .ok_or_else(|| anyhow!("thumbnail buffer size mismatch for page {page}"))?;
        let path = out_dir.join(format!("page-{:03}.png", page + 1));
        image
            .save(&path)
            .with_context(|| format!("failed to write {:?}", path))?;
        written += 1;
    }

    // Per-page render failures are reported out-of-band and do not abort the run.
    if let Some(scheduler) = session.scheduler() {
        for event in scheduler.drain_events() {
            if let RenderEvent::Failed { surface, error } = event {
                eprintln!("page {} failed to render: {error}", surface.page_index + 1);
            }
        }
    }

    println!("wrote {written} thumbnails to {}", out_dir.display());
    Ok(())
}

async fn fetch(
    config: &PagedeckConfig,
    base_url: &str,
    id: DocumentId,
    output: &Path,
) -> Result<()> {
    let gateway = HttpGateway::new(base_url, Duration::from_secs(config.request_timeout_secs))?;
    let bytes = gateway.download(id).await?;
    fs::write(output, &bytes).with_context(|| format!("failed to write {:?}", output))?;
    println!("downloaded {} bytes to {}", bytes.len(), output.display());
    Ok(())
}

async fn push(
    config: &PagedeckConfig,
    base_url: &str,
    file: &Path,
    id: Option<DocumentId>,
) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("failed to read {:?}", file))?;
    let id = id.unwrap_or_else(|| document_id_for_bytes(&bytes));
    let gateway = HttpGateway::new(base_url, Duration::from_secs(config.request_timeout_secs))?;
    let receipt = gateway.upload(id, Bytes::from(bytes)).await?;
    println!("uploaded {} -> {}", id, receipt.file_path);
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "pagedeck.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
