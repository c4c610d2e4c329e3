pub mod fake;
pub mod openai;

use crate::config::JudgeSettings;
use crate::model::{ContentPart, LlmResponse};
use async_trait::async_trait;
use std::sync::Arc;

pub use fake::FakeClient;
pub use openai::OpenAIClient;

/// Black-box completion capability: `complete(system, content) -> text`.
///
/// Failure modes the engine expects and recovers from: timeout, empty body,
/// non-text body. All surface as `Err`; callers treat them as "no verdict".
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_content: &[ContentPart],
    ) -> anyhow::Result<LlmResponse>;

    fn provider_name(&self) -> &'static str;
}

/// Build a client from settings. Unknown providers are a config error.
pub fn build_client(settings: &JudgeSettings) -> anyhow::Result<Arc<dyn LlmClient>> {
    match settings.provider.as_str() {
        "openai" => {
            let api_key = std::env::var(&settings.api_key_env).map_err(|_| {
                anyhow::anyhow!(
                    "judge provider 'openai' requires the {} environment variable",
                    settings.api_key_env
                )
            })?;
            Ok(Arc::new(OpenAIClient::new(settings, api_key)))
        }
        "fake" => Ok(Arc::new(FakeClient::new(settings.model.clone()))),
        other => anyhow::bail!("unknown judge provider: {}", other),
    }
}
