pub mod fetch_url;

use std::sync::Arc;

use crate::registry::ToolRegistry;

/// Registry holding every built-in tool. Embedders register their own
/// domain tools on top. Fails when the HTTP client cannot be built.
pub fn default_registry() -> Result<ToolRegistry, reqwest::Error> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(fetch_url::FetchUrlTool::new()?));
    Ok(registry)
}
