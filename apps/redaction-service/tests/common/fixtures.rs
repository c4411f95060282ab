//! In-memory collaborators and PDF builders for pipeline tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use redaction_core::{Extraction, LayoutPage, LayoutResult, PiiEntity, Polygon, Word};
use redaction_service::collaborators::{BlobStore, EntityRecognizer, LayoutExtractor, PiiDetector};
use redaction_service::PipelineError;

pub struct FakeExtractor {
    pub result: Result<Extraction, String>,
    pub delay: Option<Duration>,
}

impl FakeExtractor {
    pub fn returning(extraction: Extraction) -> Self {
        Self {
            result: Ok(extraction),
            delay: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            delay: None,
        }
    }
}

#[async_trait]
impl LayoutExtractor for FakeExtractor {
    async fn analyze(&self, _pdf: &[u8]) -> Result<Extraction, PipelineError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone().map_err(PipelineError::Extraction)
    }
}

#[derive(Default)]
pub struct FakeDetector {
    pub values: Vec<String>,
    pub malformed: bool,
    pub seen_entities: Mutex<Vec<PiiEntity>>,
}

impl FakeDetector {
    pub fn returning(values: &[&str]) -> Self {
        Self {
            values: values.iter().map(|v| v.to_string()).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl PiiDetector for FakeDetector {
    async fn detect(
        &self,
        _text: &str,
        entities: &[PiiEntity],
    ) -> Result<Vec<String>, PipelineError> {
        self.seen_entities.lock().unwrap().extend_from_slice(entities);
        if self.malformed {
            return Err(PipelineError::DetectionParse("expected a JSON array".into()));
        }
        Ok(self.values.clone())
    }
}

pub struct FakeRecognizer {
    pub entities: Vec<PiiEntity>,
}

#[async_trait]
impl EntityRecognizer for FakeRecognizer {
    async fn recognize(&self, _text: &str) -> Result<Vec<PiiEntity>, PipelineError> {
        Ok(self.entities.clone())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn get(&self, container: &str, name: &str) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(&(container.to_string(), name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put(&self, container: &str, name: &str, bytes: Vec<u8>) -> Result<(), PipelineError> {
        self.blobs
            .lock()
            .unwrap()
            .insert((container.to_string(), name.to_string()), bytes);
        Ok(())
    }
}

/// Letter-size pages of Helvetica 12pt text, one `(x, y, text)` run per entry.
pub fn text_pdf(pages: &[&[(i64, i64, &str)]]) -> Vec<u8> {
    let mut doc = Document::with_version("1.7");
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
    for runs in pages {
        let mut operations = Vec::new();
        for (x, y, text) in runs.iter() {
            operations.push(Operation::new("BT", vec![]));
            operations.push(Operation::new(
                "Tf",
                vec![Object::Name(b"F1".to_vec()), Object::Integer(12)],
            ));
            operations.push(Operation::new(
                "Td",
                vec![Object::Integer(*x), Object::Integer(*y)],
            ));
            operations.push(Operation::new(
                "Tj",
                vec![Object::string_literal(text.as_bytes().to_vec())],
            ));
            operations.push(Operation::new("ET", vec![]));
        }
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        kids.push(Object::Reference(page_id));
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).unwrap();
    buffer
}

/// Decoded content of every stream in the file, concatenated.
pub fn stream_text(bytes: &[u8]) -> Vec<u8> {
    let doc = Document::load_mem(bytes).unwrap();
    let mut out = Vec::new();
    for object in doc.objects.values() {
        if let Object::Stream(stream) = object {
            out.extend(
                stream
                    .decompressed_content()
                    .unwrap_or_else(|_| stream.content.clone()),
            );
            out.push(b'\n');
        }
    }
    out
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

pub fn count(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

pub fn page_count(bytes: &[u8]) -> usize {
    Document::load_mem(bytes).unwrap().get_pages().len()
}

/// One 1000x1200 model page per entry, words given with model-space bounds.
pub fn layout(pages: &[&[(&str, [f64; 4])]]) -> Extraction {
    let pages = pages
        .iter()
        .enumerate()
        .map(|(number, words)| LayoutPage {
            number,
            width: 1000.0,
            height: 1200.0,
            lines: vec![],
            words: words
                .iter()
                .map(|(content, [x0, y0, x1, y1])| Word {
                    content: content.to_string(),
                    polygon: Some(Polygon::from_bounds(*x0, *y0, *x1, *y1)),
                })
                .collect(),
        })
        .collect();

    Extraction {
        layout: LayoutResult {
            content: String::new(),
            pages,
        },
        fields: vec![],
    }
}
