use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Message Types
// =============================================================================

/// One typed unit of agent CLI output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Session initialisation and other system notices.
    System(SystemMessage),
    /// Model turn: text, thinking and tool calls.
    Assistant(AssistantMessage),
    /// Tool results fed back to the model.
    User(UserMessage),
    /// Final outcome of the run with usage and cost.
    Result(ResultMessage),
}

impl Message {
    /// Joined text of all text blocks (or the result text for a result message).
    pub fn text(&self) -> Option<String> {
        match self {
            Message::Assistant(m) => join_text(&m.content),
            Message::User(m) => join_text(&m.content),
            Message::Result(m) => m.result.clone(),
            Message::System(_) => None,
        }
    }

    /// Tool-use blocks carried by an assistant message.
    pub fn tool_uses(&self) -> Vec<&ToolUseBlock> {
        match self {
            Message::Assistant(m) => m
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse(tool) => Some(tool),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Message::Result(_))
    }

    pub fn as_result(&self) -> Option<&ResultMessage> {
        match self {
            Message::Result(m) => Some(m),
            _ => None,
        }
    }
}

fn join_text(blocks: &[ContentBlock]) -> Option<String> {
    let parts: Vec<&str> = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(""))
    }
}

/// A content block inside an assistant or user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

/// The outcome of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    /// The raw event, for fields not modelled above.
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl AssistantMessage {
    /// An assistant message holding a single text block.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            model: None,
            session_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Token accounting reported with a result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultMessage {
    pub subtype: String,
    pub is_error: bool,
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub duration_ms: u64,
    pub duration_api_ms: u64,
    pub num_turns: u32,
    pub total_cost_usd: Option<f64>,
    pub usage: Option<Usage>,
}

impl Default for ResultMessage {
    fn default() -> Self {
        Self {
            subtype: "success".to_string(),
            is_error: false,
            result: None,
            session_id: None,
            duration_ms: 0,
            duration_api_ms: 0,
            num_turns: 0,
            total_cost_usd: None,
            usage: None,
        }
    }
}

impl ResultMessage {
    /// A synthetic successful result wrapping plain text output.
    pub fn from_text(text: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            result: Some(text.into()),
            duration_ms,
            ..Default::default()
        }
    }
}
