//! Chat-completion text generator.
//!
//! Each [`GenerationRequest`] becomes one OpenAI-compatible
//! `POST {url}/chat/completions` call in JSON mode: a system message naming
//! the task and its response shape, and a user message holding the request
//! context as JSON. The assistant content must itself be a JSON object.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use finsight_core::error::CollaboratorError;
use finsight_core::generator::{GenerationRequest, GenerationTask, TextGenerator};

use crate::config::LlmConfig;
use crate::http::{build_client, post_json};

const OPENAI_URL: &str = "https://api.openai.com/v1";

/// Build the generator named by `config.provider`.
pub fn create_generator(config: &LlmConfig) -> Result<Arc<dyn TextGenerator>> {
    match config.provider.as_str() {
        "openai" => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
            let model = config
                .model
                .clone()
                .ok_or_else(|| anyhow::anyhow!("llm.model required for 'openai'"))?;
            Ok(Arc::new(ChatGenerator {
                client: build_client(config.timeout_secs)?,
                url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
                api_key,
                model,
                temperature: config.temperature,
                max_retries: config.max_retries,
            }))
        }
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

/// Fails every call as unavailable. Turns still complete, with
/// low-confidence fallback answers.
pub struct DisabledGenerator;

#[async_trait]
impl TextGenerator for DisabledGenerator {
    async fn generate(&self, _request: &GenerationRequest) -> Result<serde_json::Value, CollaboratorError> {
        Err(CollaboratorError::Unavailable("llm provider is disabled".to_string()))
    }
}

pub struct ChatGenerator {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_retries: u32,
}

fn system_prompt(task: GenerationTask) -> &'static str {
    match task {
        GenerationTask::ExtractEntities => {
            "Extract search entities from a question about company financial filings. \
             Reply with a JSON object: {\"companies\": [string], \"year\": int|null, \
             \"year_range\": [int, int]|null, \"document_type\": string|null, \
             \"fiscal_quarter\": int|null, \"sector\": string|null, \"chunk_type\": string|null, \
             \"query_type\": string, \"augmented_query\": string}."
        }
        GenerationTask::JudgeSufficiency => {
            "Decide whether the retrieved passages are enough to answer the question. \
             Reply with a JSON object: {\"sufficient\": bool, \"gaps\": [string], \
             \"additional_keywords\": [string]}."
        }
        GenerationTask::Analyze => {
            "Extract the figures needed to answer the question from the passages. \
             Reply with a JSON object: {\"summary\": string, \"findings\": [{\"label\", \"value\", \
             \"unit\", \"company\", \"period\", \"source_chunk_id\"}], \"comparisons\": \
             [{\"label\", \"from\", \"to\", \"delta\", \"growth_rate\"}]}."
        }
        GenerationTask::Explain | GenerationTask::SelfHeal => {
            "Answer the question from the passages and analysis only. \
             Reply with a JSON object: {\"text\": string, \"charts\": [{\"type\": \
             \"bar\"|\"line\"|\"pie\"|\"doughnut\", \"data\": {\"labels\": [..], \"datasets\": [..]}}], \
             \"cited_chunk_ids\": [string]}. When issues are listed, fix them."
        }
    }
}

/// The assistant message content, decoded as JSON.
fn parse_chat_response(task: GenerationTask, json: &serde_json::Value) -> Result<serde_json::Value, CollaboratorError> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| CollaboratorError::malformed(task.as_str(), "missing choices[0].message.content"))?;

    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let value: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| CollaboratorError::malformed(task.as_str(), format!("content is not JSON: {}", e)))?;
    if !value.is_object() {
        return Err(CollaboratorError::malformed(task.as_str(), "content is not a JSON object"));
    }
    Ok(value)
}

#[async_trait]
impl TextGenerator for ChatGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<serde_json::Value, CollaboratorError> {
        let endpoint = format!("{}/chat/completions", self.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": system_prompt(request.task) },
                { "role": "user", "content": request.context.to_string() },
            ],
        });

        let json = post_json(
            &self.client,
            &endpoint,
            Some(&self.api_key),
            &body,
            self.max_retries,
            "chat",
        )
        .await?;
        parse_chat_response(request.task, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(content: &str) -> serde_json::Value {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
    }

    #[test]
    fn test_parse_chat_response() {
        let value = parse_chat_response(
            GenerationTask::JudgeSufficiency,
            &reply(r#"{"sufficient": true, "gaps": []}"#),
        )
        .unwrap();
        assert_eq!(value["sufficient"], json!(true));
    }

    #[test]
    fn test_parse_chat_response_strips_fences() {
        let value = parse_chat_response(GenerationTask::Explain, &reply("```json\n{\"text\": \"ok\"}\n```")).unwrap();
        assert_eq!(value["text"], json!("ok"));
    }

    #[test]
    fn test_parse_chat_response_malformed() {
        for body in [reply("not json"), reply("[1, 2]"), json!({"choices": []})] {
            let err = parse_chat_response(GenerationTask::Analyze, &body).unwrap_err();
            assert!(matches!(err, CollaboratorError::Malformed { schema: "analyze", .. }));
        }
    }

    #[tokio::test]
    async fn test_disabled_generator_is_unavailable() {
        let generator = create_generator(&LlmConfig::default()).unwrap();
        let req = GenerationRequest::new(GenerationTask::Explain, json!({}));
        assert!(matches!(
            generator.generate(&req).await,
            Err(CollaboratorError::Unavailable(_))
        ));
    }
}
