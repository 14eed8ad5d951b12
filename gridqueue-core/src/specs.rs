//! Loading request specifications from their tracker-provided references.

use std::path::Path;

use async_trait::async_trait;
use url::Url;

use gridqueue_model::RequestSpec;

use crate::error::{QueueError, Result};

/// Checks that a spec reference is a well-formed URL or an accessible local
/// path. Anything else is a permanent, request-level validation failure.
pub fn validate_spec_reference(name: &str, reference: &str) -> Result<()> {
    if let Ok(url) = Url::parse(reference)
        && matches!(url.scheme(), "http" | "https" | "file")
    {
        return Ok(());
    }
    if Path::new(reference).exists() {
        return Ok(());
    }
    Err(QueueError::MalformedSpecReference {
        name: name.to_string(),
        reference: reference.to_string(),
    })
}

/// Resolves a spec reference to the full [`RequestSpec`] document.
#[async_trait]
pub trait SpecSource: Send + Sync {
    async fn load(&self, reference: &str) -> Result<RequestSpec>;
}

/// Reads JSON spec documents from the local filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileSpecSource;

#[async_trait]
impl SpecSource for FileSpecSource {
    async fn load(&self, reference: &str) -> Result<RequestSpec> {
        let raw = tokio::fs::read(reference).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}
