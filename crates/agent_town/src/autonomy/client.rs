//! Decision-service contract and the OpenAI-compatible client.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::simulator::{AgentId, Observation};

pub const ENV_LLM_MODEL: &str = "AGENT_TOWN_LLM_MODEL";
pub const ENV_LLM_BASE_URL: &str = "AGENT_TOWN_LLM_BASE_URL";
pub const ENV_LLM_API_KEY: &str = "AGENT_TOWN_LLM_API_KEY";
pub const ENV_LLM_TIMEOUT_MS: &str = "AGENT_TOWN_LLM_TIMEOUT_MS";
pub const ENV_LLM_SYSTEM_PROMPT: &str = "AGENT_TOWN_LLM_SYSTEM_PROMPT";

pub const DEFAULT_LLM_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_LLM_SYSTEM_PROMPT: &str = "You are a resident of a small town. \
Reply with exactly one JSON object: {\"goal\": string, \"thought\": string, \
\"utterance\": string, \"action\": {\"type\": one of none, move_to_position, \
move_to_agent, move_to_building, social_action, queue_action, apply_job, vote_job, \
negotiate_propose, negotiate_counter, negotiate_accept, commitment_declare, \
favor_create, favor_repay; \"target\": string or null, \"params\": object}, \
\"nextThinkMs\": number}.";

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub model: String,
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
    pub system_prompt: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            base_url: String::new(),
            api_key: String::new(),
            timeout_ms: DEFAULT_LLM_TIMEOUT_MS,
            system_prompt: DEFAULT_LLM_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl LlmSettings {
    /// Overlays environment variables on top of file-provided values.
    pub fn apply_env(&mut self) -> Result<(), LlmSettingsError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_env_with<F>(&mut self, mut getter: F) -> Result<(), LlmSettingsError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut set = |key: &'static str, slot: &mut String| {
            if let Some(value) = getter(key).filter(|value| !value.trim().is_empty()) {
                *slot = value;
            }
        };
        set(ENV_LLM_MODEL, &mut self.model);
        set(ENV_LLM_BASE_URL, &mut self.base_url);
        set(ENV_LLM_API_KEY, &mut self.api_key);
        set(ENV_LLM_SYSTEM_PROMPT, &mut self.system_prompt);
        let mut timeout = String::new();
        set(ENV_LLM_TIMEOUT_MS, &mut timeout);
        if !timeout.is_empty() {
            self.timeout_ms = timeout
                .trim()
                .parse::<u64>()
                .map_err(|_| LlmSettingsError::InvalidTimeout { value: timeout })?;
        }
        Ok(())
    }

    /// True when enough is set to build a remote client.
    pub fn is_configured(&self) -> bool {
        [&self.model, &self.base_url, &self.api_key]
            .iter()
            .all(|value| !value.trim().is_empty())
    }

    pub fn require_configured(&self) -> Result<(), LlmSettingsError> {
        let fields = [
            (ENV_LLM_MODEL, &self.model),
            (ENV_LLM_BASE_URL, &self.base_url),
            (ENV_LLM_API_KEY, &self.api_key),
        ];
        for (key, value) in fields {
            if value.trim().is_empty() {
                return Err(LlmSettingsError::Missing { key });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmSettingsError {
    #[error("missing decision service setting: {key}")]
    Missing { key: &'static str },
    #[error("invalid timeout value: {value}")]
    InvalidTimeout { value: String },
}

// ============================================================================
// Contract
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRequest {
    pub agent_id: AgentId,
    pub system_prompt: String,
    pub user_prompt: String,
}

impl DecisionRequest {
    /// Renders the observation into the user message.
    pub fn from_observation(
        observation: &Observation,
        system_prompt: &str,
    ) -> Result<Self, serde_json::Error> {
        let observation_json = serde_json::to_string(observation)?;
        Ok(Self {
            agent_id: observation.agent_id.clone(),
            system_prompt: system_prompt.to_string(),
            user_prompt: format!(
                "You are {} ({}). Current observation:\n{}\nDecide what to do next.",
                observation.name, observation.agent_id, observation_json
            ),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionResponse {
    pub output: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecisionClientError {
    #[error("decision request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("client build failed: {message}")]
    BuildClient { message: String },
    #[error("http request failed: {message}")]
    Http { message: String },
    #[error("http status {code}: {message}")]
    HttpStatus { code: u16, message: String },
    #[error("decode response failed: {message}")]
    DecodeResponse { message: String },
    #[error("empty completion choice")]
    EmptyChoice,
}

impl DecisionClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DecisionClientError::Timeout { .. })
    }

    pub fn tag(&self) -> &'static str {
        match self {
            DecisionClientError::Timeout { .. } => "timeout",
            DecisionClientError::BuildClient { .. } => "build_client",
            DecisionClientError::Http { .. } => "http",
            DecisionClientError::HttpStatus { .. } => "http_status",
            DecisionClientError::DecodeResponse { .. } => "decode_response",
            DecisionClientError::EmptyChoice => "empty_choice",
        }
    }
}

/// External decision service. Implementations must be cancel-safe: the
/// pipeline drops the future when its deadline passes.
#[async_trait]
pub trait DecisionClient: Send + Sync {
    async fn decide(
        &self,
        request: &DecisionRequest,
    ) -> Result<DecisionResponse, DecisionClientError>;
}

// ============================================================================
// OpenAI-compatible client
// ============================================================================

#[derive(Debug, Clone)]
pub struct OpenAiDecisionClient {
    base_url: String,
    api_key: String,
    model: String,
    timeout_ms: u64,
    client: Client,
}

impl OpenAiDecisionClient {
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, DecisionClientError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms.max(1)))
            .build()
            .map_err(|err| DecisionClientError::BuildClient {
                message: err.to_string(),
            })?;

        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            timeout_ms: settings.timeout_ms,
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn transport_error(&self, err: reqwest::Error) -> DecisionClientError {
        if err.is_timeout() {
            DecisionClientError::Timeout {
                timeout_ms: self.timeout_ms,
            }
        } else {
            DecisionClientError::Http {
                message: err.to_string(),
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn chat_payload<'a>(model: &'a str, request: &'a DecisionRequest) -> ChatCompletionRequest<'a> {
    ChatCompletionRequest {
        model,
        messages: [
            ChatMessage {
                role: "system",
                content: request.system_prompt.as_str(),
            },
            ChatMessage {
                role: "user",
                content: request.user_prompt.as_str(),
            },
        ],
    }
}

fn decode_chat_response(body: &str) -> Result<DecisionResponse, DecisionClientError> {
    let response: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|err| DecisionClientError::DecodeResponse {
            message: err.to_string(),
        })?;
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or(DecisionClientError::EmptyChoice)?;
    Ok(DecisionResponse {
        output: content,
        model: response.model,
    })
}

#[async_trait]
impl DecisionClient for OpenAiDecisionClient {
    async fn decide(
        &self,
        request: &DecisionRequest,
    ) -> Result<DecisionResponse, DecisionClientError> {
        let payload = chat_payload(&self.model, request);
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| self.transport_error(err))?;
        if status != StatusCode::OK {
            return Err(DecisionClientError::HttpStatus {
                code: status.as_u16(),
                message: body,
            });
        }
        decode_chat_response(&body)
    }
}
