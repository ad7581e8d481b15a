//! OpenAI-compatible chat-completions judge.
//!
//! Works against any endpoint exposing `POST {endpoint}/chat/completions`
//! (OpenAI, vLLM, LM Studio, Ollama's compatibility layer). The model is
//! asked to answer with a single JSON object matching [`JudgeVerdict`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Judge, JudgeCriteria, JudgeVerdict};
use crate::config::JudgeConfig;
use crate::{AppError, Result};

/// Upper bound on a single judge request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const SYSTEM_PROMPT: &str = "You are a strict evaluator of browser-automation results. \
Score how well the OUTPUT accomplishes the TASK under the listed CRITERIA. \
Respond with one JSON object and nothing else: \
{\"overall_score\": <number between 0 and 1>, \"strengths\": [<string>], \"weaknesses\": [<string>]}";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Judge backed by an OpenAI-compatible HTTP API.
pub struct OpenAiJudge {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    default_model: String,
    temperature: f32,
}

impl OpenAiJudge {
    /// Build a judge from configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be constructed.
    pub fn from_config(config: &JudgeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| AppError::Config(format!("failed to build judge client: {err}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
            default_model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    async fn score(&self, task: String, output: String, criteria: JudgeCriteria) -> Result<JudgeVerdict> {
        let model = criteria.model.as_deref().unwrap_or(&self.default_model);
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: SYSTEM_PROMPT.into(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: build_user_prompt(&task, &output, &criteria.criteria),
                },
            ],
            temperature: self.temperature,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let url = format!("{}/chat/completions", self.endpoint);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Validation(format!("judge request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Validation(format!(
                "judge returned HTTP {status}: {body}"
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::Validation(format!("judge response unreadable: {e}")))?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AppError::Validation("judge returned no choices".into()))?;

        debug!(model, "judge verdict received");
        parse_verdict(&content)
    }
}

impl Judge for OpenAiJudge {
    fn evaluate(
        &self,
        task: &str,
        output: &str,
        criteria: &JudgeCriteria,
    ) -> Pin<Box<dyn Future<Output = Result<JudgeVerdict>> + Send + '_>> {
        let task = task.to_owned();
        let output = output.to_owned();
        let criteria = criteria.clone();
        Box::pin(self.score(task, output, criteria))
    }
}

fn build_user_prompt(task: &str, output: &str, criteria: &[String]) -> String {
    let criteria = if criteria.is_empty() {
        "- The output accomplishes the task.".to_owned()
    } else {
        criteria
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!("TASK:\n{task}\n\nCRITERIA:\n{criteria}\n\nOUTPUT:\n{output}")
}

/// Parse the model's answer, tolerating Markdown code fences.
///
/// # Errors
///
/// Returns `AppError::Validation` if the text holds no verdict object or the
/// score is not a finite number.
pub fn parse_verdict(content: &str) -> Result<JudgeVerdict> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let mut verdict: JudgeVerdict = serde_json::from_str(body)
        .map_err(|e| AppError::Validation(format!("judge verdict is not valid json: {e}")))?;

    if !verdict.overall_score.is_finite() {
        return Err(AppError::Validation("judge score is not a number".into()));
    }
    verdict.overall_score = verdict.overall_score.clamp(0.0, 1.0);
    Ok(verdict)
}
