use super::LlmClient;
use crate::config::JudgeSettings;
use crate::model::{ContentPart, LlmResponse};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible chat-completions client with vision content parts.
pub struct OpenAIClient {
    model: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    pub fn new(settings: &JudgeSettings, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            model: settings.model.clone(),
            api_key,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            base_url: CHAT_COMPLETIONS_URL.to_string(),
            client,
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    /// Map typed parts onto the chat-completions wire shape.
    fn wire_content(parts: &[ContentPart]) -> serde_json::Value {
        let mapped: Vec<serde_json::Value> = parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                ContentPart::ImageRef { url } => {
                    json!({ "type": "image_url", "image_url": { "url": url } })
                }
            })
            .collect();
        json!(mapped)
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_content: &[ContentPart],
    ) -> anyhow::Result<LlmResponse> {
        let mut messages = vec![json!({ "role": "system", "content": system_prompt })];
        if !user_content.is_empty() {
            messages.push(json!({
                "role": "user",
                "content": Self::wire_content(user_content),
            }));
        }

        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let resp = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_else(|_| String::new());
            anyhow::bail!("chat API error (status {}): {}", status, error_text);
        }

        let json: serde_json::Value = resp.json().await?;
        let text = json
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("chat API response missing text content"))?;

        if text.is_empty() {
            anyhow::bail!("chat API returned an empty completion");
        }

        Ok(LlmResponse {
            text,
            provider: "openai".to_string(),
            model: self.model.clone(),
        })
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JudgeSettings;

    fn settings() -> JudgeSettings {
        JudgeSettings {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            temperature: 0.0,
            max_tokens: 1500,
            timeout_secs: 5,
        }
    }

    #[test]
    fn wire_content_maps_image_refs_to_image_url_parts() {
        let parts = vec![
            ContentPart::text("Step actual description: clicked"),
            ContentPart::image("https://host/shot.png"),
        ];
        let wire = OpenAIClient::wire_content(&parts);
        assert_eq!(wire[0]["type"], "text");
        assert_eq!(wire[1]["type"], "image_url");
        assert_eq!(wire[1]["image_url"]["url"], "https://host/shot.png");
    }

    #[tokio::test]
    async fn unreachable_endpoint_surfaces_as_error_not_panic() {
        let client = OpenAIClient::new(&settings(), "test-key".into())
            .with_base_url("http://127.0.0.1:9/only-fails".into());
        let err = client
            .complete("system", &[ContentPart::text("hi")])
            .await
            .expect_err("connection must fail");
        assert!(!err.to_string().is_empty());
    }
}
