//! Workflow source loading.
//!
//! Fetches a workflow definition through the storage layer and decodes it
//! by file extension. JSON and YAML decode here; other formats (CSV among
//! them) belong to external parsers.

use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::storage::Resource;
use crate::workflow::Workflow;

/// Download and decode a workflow definition.
pub async fn load(context: &Context, source: &Resource) -> EngineResult<Workflow> {
    let source = Resource {
        url: context.expand_text(&source.url),
        credential: context.expand_text(&source.credential),
    };
    let storage = context.storage_for(&source)?;
    let bytes = storage.download(&source.url).await?;
    let mut workflow = decode(&source.url, &bytes)?;
    if workflow.source.url.is_empty() {
        workflow.source = source;
    }
    Ok(workflow)
}

/// Decode workflow bytes based on the URL's extension.
pub fn decode(url: &str, bytes: &[u8]) -> EngineResult<Workflow> {
    let extension = url.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match extension.as_str() {
        "json" => Ok(serde_json::from_slice(bytes)?),
        "yaml" | "yml" => Ok(serde_yaml::from_slice(bytes)?),
        other => Err(EngineError::Validation(format!(
            "unsupported workflow source format '.{}' for {}",
            other, url
        ))),
    }
}
