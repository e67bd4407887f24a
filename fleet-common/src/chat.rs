//! OpenAI-style chat request and streamed chunk types.
//!
//! Nodes stream `ChatCompletionChunk`s back to the broker. The final chunk of
//! a stream may carry `usage` with an empty `choices` list; that chunk is the
//! terminal marker of a successful stream.

use serde::{Deserialize, Serialize};

/// Chat completion request forwarded to a node inside a dispatch frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Whether to stream the response.
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatCompletionRequest {
    /// Single user-turn streaming request.
    pub fn user_prompt(model: &str, prompt: &str, max_tokens: Option<u32>) -> Self {
        Self {
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: Some(prompt.to_string()),
            }],
            tools: None,
            model: Some(model.to_string()),
            temperature: None,
            max_tokens,
            stream: Some(true),
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    /// Total characters across all message contents.
    pub fn prompt_chars(&self) -> usize {
        self.messages
            .iter()
            .filter_map(|m| m.content.as_deref())
            .map(|c| c.chars().count())
            .sum()
    }
}

/// One streamed chunk of a chat completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    #[serde(default = "default_chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

fn default_chunk_object() -> String {
    "chat.completion.chunk".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    #[serde(default)]
    pub delta: ChatDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl ChatCompletionChunk {
    /// Content delta chunk with a single choice.
    pub fn delta(id: &str, model: &str, content: &str) -> Self {
        Self {
            id: id.to_string(),
            object: default_chunk_object(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChatDelta {
                    role: Some("assistant".to_string()),
                    content: Some(content.to_string()),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// Usage-only chunk that terminates a stream.
    pub fn usage_only(id: &str, model: &str, prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            id: id.to_string(),
            object: default_chunk_object(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![],
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
        }
    }

    /// A chunk with usage and no choices ends the stream successfully.
    pub fn is_usage_terminal(&self) -> bool {
        self.usage.is_some() && self.choices.is_empty()
    }

    /// Whether any choice carries non-empty content.
    pub fn has_content(&self) -> bool {
        self.choices
            .iter()
            .any(|c| c.delta.content.as_deref().is_some_and(|s| !s.is_empty()))
    }
}
