//! Router tests for the redaction service
//!
//! Requests go through the full axum stack with fake collaborators behind
//! the pipeline.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use redaction_core::{Extraction, LayoutPage, LayoutResult, PiiEntity, Polygon, Word};
use serde_json::Value;
use tower::ServiceExt;

use crate::api::{create_router, AppState};
use crate::collaborators::{BlobStore, LayoutExtractor, PiiDetector};
use crate::error::PipelineError;
use crate::pipeline::{Pipeline, PipelineSettings};

struct StaticExtractor(Option<Extraction>);

#[async_trait]
impl LayoutExtractor for StaticExtractor {
    async fn analyze(&self, _pdf: &[u8]) -> Result<Extraction, PipelineError> {
        self.0
            .clone()
            .ok_or_else(|| PipelineError::Extraction("analyze request returned 503".into()))
    }
}

struct StaticDetector(Vec<String>);

#[async_trait]
impl PiiDetector for StaticDetector {
    async fn detect(
        &self,
        _text: &str,
        _entities: &[PiiEntity],
    ) -> Result<Vec<String>, PipelineError> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct RecordingStore(Mutex<Vec<String>>);

#[async_trait]
impl BlobStore for RecordingStore {
    async fn put(&self, container: &str, name: &str, _bytes: Vec<u8>) -> Result<(), PipelineError> {
        self.0.lock().unwrap().push(format!("{}/{}", container, name));
        Ok(())
    }
}

fn one_page_pdf() -> Vec<u8> {
    let mut doc = Document::with_version("1.7");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), Object::Integer(12)]),
            Operation::new("Td", vec![Object::Integer(70), Object::Integer(700)]),
            Operation::new("Tj", vec![Object::string_literal("Smith")]),
            Operation::new("ET", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::Reference(page_id)],
            "Count" => 1,
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

fn smith_extraction() -> Extraction {
    Extraction {
        layout: LayoutResult {
            content: "Smith".to_string(),
            pages: vec![LayoutPage {
                number: 0,
                width: 1000.0,
                height: 1200.0,
                lines: vec![],
                words: vec![Word {
                    content: "Smith".to_string(),
                    polygon: Some(Polygon::from_bounds(100.0, 100.0, 200.0, 150.0)),
                }],
            }],
        },
        fields: vec![],
    }
}

fn app(extraction: Option<Extraction>, store: Arc<RecordingStore>) -> axum::Router {
    let pipeline = Pipeline::new(
        Arc::new(StaticExtractor(extraction)),
        Arc::new(StaticDetector(vec!["Smith".to_string()])),
        store,
        PipelineSettings::default(),
    );
    create_router(AppState::new(pipeline, 2))
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let response = app(None, Arc::default())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "redaction-service");
}

#[tokio::test]
async fn test_redact_document_returns_receipt() {
    let store = Arc::new(RecordingStore::default());
    let request = Request::builder()
        .method("POST")
        .uri("/api/documents/inbound/records/smith.pdf")
        .header("content-type", "application/pdf")
        .body(Body::from(one_page_pdf()))
        .unwrap();

    let response = app(Some(smith_extraction()), store.clone())
        .oneshot(request)
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["blob_name"], "records/smith-redacted.pdf");
    assert_eq!(body["redacted"], 1);
    assert_eq!(
        *store.0.lock().unwrap(),
        vec!["outbound/records/smith-redacted.pdf".to_string()]
    );
}

#[tokio::test]
async fn test_empty_body_is_rejected() {
    let store = Arc::new(RecordingStore::default());
    let request = Request::builder()
        .method("POST")
        .uri("/api/documents/inbound/a.pdf")
        .body(Body::empty())
        .unwrap();

    let response = app(Some(smith_extraction()), store.clone())
        .oneshot(request)
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "INVALID_REQUEST");
    assert!(store.0.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_extraction_failure_maps_to_bad_gateway() {
    let store = Arc::new(RecordingStore::default());
    let request = Request::builder()
        .method("POST")
        .uri("/api/documents/inbound/a.pdf")
        .body(Body::from(one_page_pdf()))
        .unwrap();

    let response = app(None, store.clone()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(response).await;
    assert_eq!(body["code"], "EXTRACTION_ERROR");
    assert!(store.0.lock().unwrap().is_empty());
}
