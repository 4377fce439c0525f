//! Global cap on in-flight annotation calls.
//!
//! Per-image component fan-out multiplies with the image worker width, so the
//! number of concurrent external calls is otherwise unbounded by anything but
//! image size. Wrapping every service in [`Throttled`] with one shared
//! semaphore bounds the total.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::{AnnotationRequest, AnnotationService};
use crate::error::AnnotationError;

/// Service decorator that holds a permit for the duration of each call.
#[derive(Debug, Clone)]
pub struct Throttled<S> {
    inner: S,
    permits: Arc<Semaphore>,
}

impl<S> Throttled<S> {
    /// Wrap `inner`, sharing `permits` with other throttled services.
    #[must_use]
    pub const fn new(inner: S, permits: Arc<Semaphore>) -> Self {
        Self { inner, permits }
    }

    #[must_use]
    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: AnnotationService> AnnotationService for Throttled<S> {
    fn label(&self) -> &str {
        self.inner.label()
    }

    async fn generate(&self, request: &AnnotationRequest) -> Result<String, AnnotationError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AnnotationError::Transport("call limiter closed".to_string()))?;
        self.inner.generate(request).await
    }
}
