use lopdf::{Document as PdfFile, Object};
use pagedeck_core::{Document, ExportError, TransformState};
use tracing::{debug, instrument};

/// Reconstructs an output document from the retained source bytes plus the
/// accumulated per-page rotation. Page content is carried over verbatim;
/// rotation is a `/Rotate` metadata write, never a re-rasterization, and is
/// written as an absolute value regardless of any rotation the source pages
/// already carried.
#[instrument(skip(document, transform), fields(id = %document.id()))]
pub async fn build(
    document: &Document,
    transform: &TransformState,
) -> Result<Vec<u8>, ExportError> {
    let source = document.source_bytes();
    if source.is_empty() {
        return Err(ExportError::SourceUnavailable);
    }

    let mut output = PdfFile::load_mem(source).map_err(|err| ExportError::CopyFailed {
        page: 0,
        detail: format!("failed to reparse source document: {err}"),
    })?;

    let pages = output.get_pages();
    for (index, (_, page_id)) in pages.iter().enumerate() {
        let degrees = transform.rotation(index);
        let dict = output
            .get_object_mut(*page_id)
            .and_then(Object::as_dict_mut)
            .map_err(|err| ExportError::CopyFailed {
                page: index,
                detail: err.to_string(),
            })?;
        dict.set("Rotate", i64::from(degrees));
    }

    let mut bytes = Vec::new();
    output
        .save_to(&mut bytes)
        .map_err(|err| ExportError::CopyFailed {
            page: 0,
            detail: format!("failed to serialize output document: {err}"),
        })?;

    debug!(pages = pages.len(), bytes = bytes.len(), "export built");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Stream};
    use pagedeck_core::{
        DocumentDecoder, LoadError, PageRasterizer, RasterRequest, RenderError, RenderImage,
        RotateDirection,
    };

    struct StubRasterizer {
        pages: usize,
    }

    #[async_trait]
    impl PageRasterizer for StubRasterizer {
        fn page_count(&self) -> usize {
            self.pages
        }

        async fn rasterize(&self, _request: RasterRequest) -> Result<RenderImage, RenderError> {
            Ok(RenderImage {
                width: 1,
                height: 1,
                pixels: vec![0],
            })
        }
    }

    struct StubDecoder;

    #[async_trait]
    impl DocumentDecoder for StubDecoder {
        async fn decode(&self, bytes: Bytes) -> Result<Arc<dyn PageRasterizer>, LoadError> {
            let parsed = PdfFile::load_mem(&bytes).map_err(|err| LoadError::Malformed {
                detail: err.to_string(),
            })?;
            Ok(Arc::new(StubRasterizer {
                pages: parsed.get_pages().len(),
            }))
        }
    }

    fn fixture_pdf(pages: usize) -> Vec<u8> {
        let mut doc = PdfFile::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids = Vec::new();
        for index in 0..pages {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 24.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new(
                        "Tj",
                        vec![Object::string_literal(format!("Page {}", index + 1))],
                    ),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            });
            kids.push(page_id.into());
        }

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => pages as i64,
                "Resources" => resources_id,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    async fn load_fixture(bytes: Vec<u8>) -> Document {
        Document::load(&StubDecoder, Bytes::from(bytes)).await.unwrap()
    }

    #[tokio::test]
    async fn export_without_rotations_preserves_page_content() {
        let source = fixture_pdf(3);
        let document = load_fixture(source.clone()).await;
        let transform = TransformState::new(document.page_count());

        let exported = build(&document, &transform).await.unwrap();

        let original = PdfFile::load_mem(&source).unwrap();
        let roundtrip = PdfFile::load_mem(&exported).unwrap();
        let original_pages = original.get_pages();
        let exported_pages = roundtrip.get_pages();
        assert_eq!(exported_pages.len(), 3);

        for (number, page_id) in &exported_pages {
            assert_eq!(
                roundtrip.get_page_content(*page_id).unwrap(),
                original.get_page_content(original_pages[number]).unwrap(),
                "content of page {number} must survive export byte for byte",
            );
        }
    }

    #[tokio::test]
    async fn export_writes_rotation_for_every_page() {
        let source = fixture_pdf(3);
        let document = load_fixture(source).await;

        let state = TransformState::new(3);
        let (state, _) = state.toggle_selection(1);
        let (state, _) = state.rotate(RotateDirection::Clockwise);
        let (state, _) = state.rotate(RotateDirection::Clockwise);
        assert_eq!(state.rotation(1), 180);

        let exported = build(&document, &state).await.unwrap();
        let parsed = PdfFile::load_mem(&exported).unwrap();

        for (index, (_, page_id)) in parsed.get_pages().iter().enumerate() {
            let dict = parsed.get_object(*page_id).and_then(Object::as_dict).unwrap();
            let rotate = dict.get(b"Rotate").and_then(Object::as_i64).unwrap();
            assert_eq!(rotate, i64::from(state.rotation(index)));
        }
    }

    #[tokio::test]
    async fn export_replaces_source_rotation_instead_of_composing() {
        let mut pre_rotated = PdfFile::load_mem(&fixture_pdf(2)).unwrap();
        let page_ids: Vec<_> = pre_rotated.get_pages().values().copied().collect();
        pre_rotated
            .get_object_mut(page_ids[0])
            .and_then(Object::as_dict_mut)
            .unwrap()
            .set("Rotate", 90i64);
        let mut source = Vec::new();
        pre_rotated.save_to(&mut source).unwrap();

        let document = load_fixture(source).await;
        let transform = TransformState::new(2);
        let exported = build(&document, &transform).await.unwrap();

        let parsed = PdfFile::load_mem(&exported).unwrap();
        for page_id in parsed.get_pages().values() {
            let dict = parsed.get_object(*page_id).and_then(Object::as_dict).unwrap();
            assert_eq!(dict.get(b"Rotate").and_then(Object::as_i64).unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn export_leaves_inputs_untouched() {
        let source = fixture_pdf(2);
        let document = load_fixture(source.clone()).await;
        let (transform, _) = TransformState::new(2).rotate(RotateDirection::Clockwise);

        let _ = build(&document, &transform).await.unwrap();

        assert_eq!(document.source_bytes().as_ref(), source.as_slice());
        assert_eq!(transform.rotation(0), 90);
    }
}
