//! Annotation services: anything that turns an image plus an instruction into
//! text.
//!
//! The pipeline only sees the [`AnnotationService`] trait. Concrete services:
//!
//! - [`openai::OpenAiCompatibleClient`] - chat-completions endpoint with
//!   vision input, retried with [`crate::retry::retry`]
//! - [`throttle::Throttled`] - caps in-flight calls across every image

pub mod openai;
pub mod throttle;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::AnnotationError;
use crate::geometry::BoundingBox;

pub use openai::{EndpointConfig, OpenAiCompatibleClient};
pub use throttle::Throttled;

/// One request to an annotation service.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationRequest {
    /// Absolute path of the diagram image.
    pub image_path: PathBuf,
    pub prompt: String,
    /// Region of interest, when the request is about one component.
    pub region: Option<BoundingBox>,
    /// Ask the service for a bare JSON object.
    pub expect_json: bool,
}

impl AnnotationRequest {
    #[must_use]
    pub fn new(image_path: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            image_path: image_path.into(),
            prompt: prompt.into(),
            region: None,
            expect_json: false,
        }
    }

    #[must_use]
    pub const fn with_region(mut self, region: BoundingBox) -> Self {
        self.region = Some(region);
        self
    }

    #[must_use]
    pub const fn expecting_json(mut self) -> Self {
        self.expect_json = true;
        self
    }
}

/// An opaque capability that answers questions about an image.
#[async_trait]
pub trait AnnotationService: Send + Sync {
    /// Short label used as the source key in persisted records.
    fn label(&self) -> &str;

    /// Answer one request.
    ///
    /// # Errors
    ///
    /// Returns an [`AnnotationError`]; only `Transport` errors are worth
    /// retrying.
    async fn generate(&self, request: &AnnotationRequest) -> Result<String, AnnotationError>;
}

#[async_trait]
impl<T: AnnotationService + ?Sized> AnnotationService for Arc<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    async fn generate(&self, request: &AnnotationRequest) -> Result<String, AnnotationError> {
        (**self).generate(request).await
    }
}
