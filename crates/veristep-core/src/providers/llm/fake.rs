use super::LlmClient;
use crate::model::{ContentPart, LlmResponse};
use async_trait::async_trait;
use std::sync::Mutex;

/// One recorded judge invocation, for assertions on request assembly.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system_prompt: String,
    pub user_content: Vec<ContentPart>,
}

/// Scripted test double. Responses are consumed in order; an exhausted
/// script fails the call, which the engine treats like any judge failure.
pub struct FakeClient {
    model: String,
    responses: Mutex<Vec<String>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeClient {
    pub fn new(model: String) -> Self {
        Self {
            model,
            responses: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn scripted(responses: Vec<String>) -> Self {
        Self {
            model: "fake".to_string(),
            responses: Mutex::new(responses),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push(response.into());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for FakeClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_content: &[ContentPart],
    ) -> anyhow::Result<LlmResponse> {
        self.calls.lock().unwrap().push(RecordedCall {
            system_prompt: system_prompt.to_string(),
            user_content: user_content.to_vec(),
        });

        let mut resps = self.responses.lock().unwrap();
        if resps.is_empty() {
            anyhow::bail!("no more scripted responses");
        }
        let text = resps.remove(0);
        Ok(LlmResponse {
            text,
            provider: "fake".to_string(),
            model: self.model.clone(),
        })
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }
}
