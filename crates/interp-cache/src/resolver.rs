use std::sync::Arc;

use async_trait::async_trait;
use stepwright_core_types::{Command, CoreError, PageState};

/// Turns a natural-language step into a structured command. Expensive and
/// fallible; implementations carry no caching of their own.
#[async_trait]
pub trait AiResolver: Send + Sync {
    async fn resolve(&self, description: &str, page: &PageState) -> Result<Command, CoreError>;
}

#[async_trait]
impl<R> AiResolver for Arc<R>
where
    R: AiResolver + ?Sized,
{
    async fn resolve(&self, description: &str, page: &PageState) -> Result<Command, CoreError> {
        (**self).resolve(description, page).await
    }
}
