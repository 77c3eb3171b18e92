use std::mem;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use pagedeck_core::{
    DocumentDecoder, LoadError, PageRasterizer, RasterRequest, RenderError, RenderImage, MIN_SCALE,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{instrument, warn};

const PDF_MAGIC: &[u8] = b"%PDF-";

fn looks_like_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(PDF_MAGIC)
}

/// Decodes raw PDF bytes into renderable page handles backed by Pdfium.
pub struct PdfiumDecoder {
    pdfium: Arc<Pdfium>,
}

impl PdfiumDecoder {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_build_hint() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentDecoder for PdfiumDecoder {
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    async fn decode(&self, bytes: Bytes) -> Result<Arc<dyn PageRasterizer>, LoadError> {
        if !looks_like_pdf(&bytes) {
            return Err(LoadError::Unsupported {
                detail: "payload does not carry a %PDF header".into(),
            });
        }
        let rasterizer = PdfiumRasterizer::new(Arc::clone(&self.pdfium), bytes)?;
        Ok(Arc::new(rasterizer))
    }
}

struct PdfiumRasterizer {
    // Declared first: the cached document borrows from `pdfium` and `bytes`
    // below and must drop before either of them.
    document: Mutex<Option<PdfDocument<'static>>>,
    pdfium: Arc<Pdfium>,
    bytes: Bytes,
    page_count: usize,
}

impl PdfiumRasterizer {
    fn new(pdfium: Arc<Pdfium>, bytes: Bytes) -> Result<Self, LoadError> {
        let page_count = {
            let document = pdfium
                .load_pdf_from_byte_slice(&bytes, None)
                .map_err(|err| LoadError::Malformed {
                    detail: err.to_string(),
                })?;
            usize::try_from(document.pages().len()).unwrap_or_default()
        };
        if page_count == 0 {
            return Err(LoadError::Empty);
        }
        Ok(Self {
            document: Mutex::new(None),
            pdfium,
            bytes,
            page_count,
        })
    }

    fn open_document(&self) -> Result<PdfDocument<'static>> {
        let document = self
            .pdfium
            .load_pdf_from_byte_slice(&self.bytes, None)
            .context("failed to reopen retained document bytes")?;
        // SAFETY: the returned PdfDocument borrows the Pdfium bindings behind
        // self.pdfium and the byte buffer behind self.bytes. Both live as long
        // as self, the Bytes buffer never moves, and the cached document is
        // declared before them so struct drop order (declaration order) tears
        // it down first.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    fn with_document<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PdfDocument<'static>) -> Result<R>,
    {
        let mut guard = self.document.lock();
        if guard.is_none() {
            let document = self.open_document()?;
            *guard = Some(document);
        }
        let document = guard.as_ref().expect("document must be loaded");
        f(document)
    }
}

#[async_trait]
impl PageRasterizer for PdfiumRasterizer {
    fn page_count(&self) -> usize {
        self.page_count
    }

    async fn rasterize(&self, request: RasterRequest) -> Result<RenderImage, RenderError> {
        self.with_document(|document| render_page(document, &request))
            .map_err(|err| RenderError::DecodeFailed {
                page: request.page_index,
                detail: format!("{err:#}"),
            })
    }
}

fn render_page(document: &PdfDocument<'_>, request: &RasterRequest) -> Result<RenderImage> {
    let page_index: PdfPageIndex = request
        .page_index
        .try_into()
        .map_err(|_| anyhow!("page {} is out of supported range", request.page_index))?;
    let page = document
        .pages()
        .get(page_index)
        .with_context(|| format!("page {} out of range", request.page_index))?;

    let config = PdfRenderConfig::new()
        .scale_page_by_factor(request.scale.max(MIN_SCALE))
        .rotate(rotation_for_degrees(request.rotation), true);
    let bitmap = page
        .render_with_config(&config)
        .with_context(|| format!("failed to render page {}", request.page_index))?;
    let image = bitmap.as_image().to_rgba8();
    let (width, height) = image.dimensions();

    Ok(RenderImage {
        width,
        height,
        pixels: image.into_raw(),
    })
}

fn rotation_for_degrees(degrees: u16) -> PdfPageRenderRotation {
    match degrees {
        90 => PdfPageRenderRotation::Degrees90,
        180 => PdfPageRenderRotation::Degrees180,
        270 => PdfPageRenderRotation::Degrees270,
        _ => PdfPageRenderRotation::None,
    }
}

fn bind_pdfium_from_build_hint() -> Option<Pdfium> {
    match option_env!("PAGEDECK_PDFIUM_LIBRARY_PATH") {
        Some(path) if !path.is_empty() => match Pdfium::bind_to_library(path) {
            Ok(bindings) => Some(Pdfium::new(bindings)),
            Err(err) => {
                warn!(
                    "failed to load Pdfium from build-provided path {}: {}",
                    path, err
                );
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
                "failed to bind to a pdfium library; ensure it is installed ({})",
                errors.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_magic_sniffing() {
        assert!(looks_like_pdf(b"%PDF-1.7\n..."));
        assert!(!looks_like_pdf(b"PK\x03\x04 not a pdf"));
        assert!(!looks_like_pdf(b""));
    }

    #[test]
    fn quarter_turns_map_onto_pdfium_rotations() {
        assert_eq!(rotation_for_degrees(0), PdfPageRenderRotation::None);
        assert_eq!(rotation_for_degrees(90), PdfPageRenderRotation::Degrees90);
        assert_eq!(rotation_for_degrees(180), PdfPageRenderRotation::Degrees180);
        assert_eq!(rotation_for_degrees(270), PdfPageRenderRotation::Degrees270);
        // Normalization happens upstream; anything off-grid renders unrotated.
        assert_eq!(rotation_for_degrees(45), PdfPageRenderRotation::None);
    }
}
