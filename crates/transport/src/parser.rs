//! Conversion of agent CLI output into typed [`Message`]s.
//!
//! * [`MessageParser`] maps one JSON event to a message.
//! * [`ResultParser`] handles the single-document `json` format.
//! * [`StreamingParser`] consumes output line by line for every format,
//!   reassembling JSON objects that span several lines.

use serde_json::Value;
use std::collections::VecDeque;

use agent_runner_core::{
    AssistantMessage, ContentBlock, Error, Message, Result, ResultMessage, SystemMessage,
    UserMessage,
};

use crate::options::OutputFormat;

/// A fragment that grows past this is dropped instead of buffered further.
const MAX_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// Longest raw excerpt kept in a parse error.
const RAW_EXCERPT_CHARS: usize = 512;

// =============================================================================
// Message Parser
// =============================================================================

/// Stateless mapping from stream-json events to messages.
pub struct MessageParser;

impl MessageParser {
    /// Parse one event. Unknown event types yield `Ok(None)`.
    pub fn parse_value(value: &Value) -> Result<Option<Message>> {
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return Err(Error::parse("event has no 'type' field", excerpt(&value.to_string())));
        };

        let message = match kind {
            "system" => Message::System(SystemMessage {
                subtype: str_field(value, "subtype").unwrap_or_default(),
                session_id: str_field(value, "session_id"),
                model: str_field(value, "model"),
                cwd: str_field(value, "cwd"),
                tools: value
                    .get("tools")
                    .and_then(Value::as_array)
                    .map(|tools| {
                        tools
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                data: value.clone(),
            }),
            "assistant" => {
                let body = value.get("message").unwrap_or(value);
                Message::Assistant(AssistantMessage {
                    content: content_blocks(body)?,
                    model: str_field(body, "model"),
                    session_id: str_field(value, "session_id"),
                })
            }
            "user" => {
                let body = value.get("message").unwrap_or(value);
                Message::User(UserMessage {
                    content: content_blocks(body)?,
                    session_id: str_field(value, "session_id"),
                })
            }
            "result" => Message::Result(serde_json::from_value(value.clone()).map_err(|e| {
                Error::parse(format!("invalid result event: {}", e), excerpt(&value.to_string()))
            })?),
            other => {
                tracing::debug!(event_type = %other, "Skipping unknown event type");
                return Ok(None);
            }
        };
        Ok(Some(message))
    }

    /// Parse one line of stream-json output.
    pub fn parse_line(line: &str) -> Result<Option<Message>> {
        let value: Value = serde_json::from_str(line.trim())
            .map_err(|e| Error::parse(e.to_string(), excerpt(line)))?;
        Self::parse_value(&value)
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Content is either a block array or a bare string. Unknown block types are skipped.
fn content_blocks(body: &Value) -> Result<Vec<ContentBlock>> {
    match body.get("content") {
        Some(Value::String(text)) => Ok(vec![ContentBlock::text(text.clone())]),
        Some(Value::Array(blocks)) => Ok(blocks
            .iter()
            .filter_map(|block| match serde_json::from_value(block.clone()) {
                Ok(block) => Some(block),
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unrecognised content block");
                    None
                }
            })
            .collect()),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(other) => Err(Error::parse(
            "message content is neither a string nor an array",
            excerpt(&other.to_string()),
        )),
    }
}

fn excerpt(raw: &str) -> String {
    raw.chars().take(RAW_EXCERPT_CHARS).collect()
}

// =============================================================================
// Result Parser
// =============================================================================

/// Parser for the single-document `json` output format.
pub struct ResultParser;

impl ResultParser {
    /// Parse complete output into `[Assistant?, Result]`.
    ///
    /// The assistant message is synthesized from the result text and only
    /// present when that text is non-empty. Diagnostic lines around the
    /// document are tolerated: when the whole output is not JSON, the last
    /// line holding a JSON object is used.
    ///
    /// Empty output yields [`Error::EmptyOutput`], distinct from
    /// [`Error::Parse`] so callers can retry it.
    pub fn parse(output: &str) -> Result<Vec<Message>> {
        let trimmed = output.trim();
        if trimmed.is_empty() {
            tracing::warn!("Agent CLI exited successfully but produced no output");
            return Err(Error::EmptyOutput);
        }

        let value = match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => value,
            Err(full_err) => trimmed
                .lines()
                .rev()
                .map(str::trim)
                .filter(|line| line.starts_with('{'))
                .find_map(|line| serde_json::from_str::<Value>(line).ok())
                .ok_or_else(|| Error::parse(full_err.to_string(), excerpt(trimmed)))?,
        };

        if !value.is_object() {
            return Err(Error::parse("expected a JSON object", excerpt(trimmed)));
        }

        let result: ResultMessage = serde_json::from_value(value)
            .map_err(|e| Error::parse(format!("invalid result document: {}", e), excerpt(trimmed)))?;

        let mut messages = Vec::with_capacity(2);
        if let Some(text) = result.result.as_deref().filter(|t| !t.is_empty()) {
            messages.push(Message::Assistant(AssistantMessage {
                session_id: result.session_id.clone(),
                ..AssistantMessage::from_text(text)
            }));
        }
        messages.push(Message::Result(result));
        Ok(messages)
    }
}

// =============================================================================
// Streaming Parser
// =============================================================================

/// Whether a partial JSON fragment is being accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    NoBuffer,
    Buffering,
}

/// Incremental, line-fed parser.
///
/// * `stream-json`: each complete JSON object becomes a message as soon as
///   its last line arrives. Non-JSON lines are skipped. A fragment still
///   incomplete when the stream closes is discarded.
/// * `text`: lines accumulate and a single [`ResultMessage`] is emitted on
///   [`finish`](Self::finish).
/// * `json`: the whole output is collected and handed to [`ResultParser`] on
///   `finish`.
#[derive(Debug)]
pub struct StreamingParser {
    format: OutputFormat,
    state: ParserState,
    buffer: String,
}

impl StreamingParser {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            state: ParserState::NoBuffer,
            buffer: String::new(),
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Feed one line (without its newline). Returns a message when the line
    /// completes one.
    pub fn feed(&mut self, line: &str) -> Option<Message> {
        match self.format {
            OutputFormat::StreamJson => self.feed_json_line(line),
            OutputFormat::Text | OutputFormat::Json => {
                if self.state == ParserState::Buffering {
                    self.buffer.push('\n');
                }
                self.buffer.push_str(line);
                self.state = ParserState::Buffering;
                None
            }
        }
    }

    /// Signal end of stream and flush what the format allows.
    pub fn finish(&mut self) -> Result<Vec<Message>> {
        let residual = std::mem::take(&mut self.buffer);
        let was_buffering = self.state == ParserState::Buffering;
        self.state = ParserState::NoBuffer;

        match self.format {
            OutputFormat::StreamJson => {
                if was_buffering {
                    tracing::warn!(
                        bytes = residual.len(),
                        "Discarding incomplete JSON fragment at end of stream"
                    );
                }
                Ok(Vec::new())
            }
            // Text always ends in exactly one result, empty output included.
            OutputFormat::Text => Ok(vec![Message::Result(ResultMessage::from_text(residual, 0))]),
            OutputFormat::Json => ResultParser::parse(&residual),
        }
    }

    /// Lazily parse `lines`, finishing when they run out.
    pub fn messages<I>(self, lines: I) -> Messages<I::IntoIter>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Messages {
            lines: lines.into_iter(),
            parser: self,
            pending: VecDeque::new(),
            finished: false,
        }
    }

    fn feed_json_line(&mut self, line: &str) -> Option<Message> {
        if self.state == ParserState::Buffering {
            self.buffer.push('\n');
            self.buffer.push_str(line);
            match serde_json::from_str::<Value>(&self.buffer) {
                Ok(value) => {
                    self.buffer.clear();
                    self.state = ParserState::NoBuffer;
                    return message_or_skip(&value);
                }
                Err(e) if e.is_eof() && self.buffer.len() <= MAX_BUFFER_BYTES => return None,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        bytes = self.buffer.len(),
                        "Discarding unparseable JSON fragment"
                    );
                    self.buffer.clear();
                    self.state = ParserState::NoBuffer;
                    // The line that broke the fragment may start a new object.
                }
            }
        }

        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            if !trimmed.is_empty() {
                tracing::debug!(line = %excerpt(trimmed), "Skipping non-JSON output line");
            }
            return None;
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => message_or_skip(&value),
            Err(e) if e.is_eof() => {
                self.buffer.push_str(trimmed);
                self.state = ParserState::Buffering;
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, line = %excerpt(trimmed), "Skipping malformed JSON line");
                None
            }
        }
    }
}

fn message_or_skip(value: &Value) -> Option<Message> {
    match MessageParser::parse_value(value) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping unparseable stream event");
            None
        }
    }
}

/// Iterator returned by [`StreamingParser::messages`].
///
/// Finite and non-restartable: it ends once the input lines are exhausted
/// and the parser has been flushed.
pub struct Messages<I> {
    lines: I,
    parser: StreamingParser,
    pending: VecDeque<Result<Message>>,
    finished: bool,
}

impl<I> Iterator for Messages<I>
where
    I: Iterator,
    I::Item: AsRef<str>,
{
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.finished {
                return None;
            }
            match self.lines.next() {
                Some(line) => {
                    if let Some(message) = self.parser.feed(line.as_ref()) {
                        return Some(Ok(message));
                    }
                }
                None => {
                    self.finished = true;
                    match self.parser.finish() {
                        Ok(messages) => self.pending.extend(messages.into_iter().map(Ok)),
                        Err(e) => self.pending.push_back(Err(e)),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_single_json_result() {
        let messages = ResultParser::parse(r#"{"result":"done","is_error":false}"#).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text().as_deref(), Some("done"));
        assert!(matches!(messages[0], Message::Assistant(_)));
        let result = messages[1].as_result().unwrap();
        assert_eq!(result.result.as_deref(), Some("done"));
        assert!(!result.is_error);
    }

    #[test]
    fn test_result_without_text_has_no_assistant() {
        let messages = ResultParser::parse(r#"{"type":"result","result":"","is_error":true}"#)
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].as_result().unwrap().is_error);
    }

    #[test]
    fn test_result_metadata() {
        let raw = r#"{"type":"result","subtype":"success","is_error":false,"duration_ms":1200,
            "duration_api_ms":900,"num_turns":2,"result":"ok","session_id":"s1",
            "total_cost_usd":0.012,"usage":{"input_tokens":10,"output_tokens":4}}"#;
        let messages = ResultParser::parse(raw).unwrap();
        let result = messages.last().unwrap().as_result().unwrap();
        assert_eq!(result.duration_ms, 1200);
        assert_eq!(result.num_turns, 2);
        assert_eq!(result.session_id.as_deref(), Some("s1"));
        assert_eq!(result.total_cost_usd, Some(0.012));
        assert_eq!(result.usage.as_ref().unwrap().total_tokens(), 14);
    }

    #[test]
    fn test_empty_output_is_distinct_from_parse_error() {
        assert!(matches!(ResultParser::parse("  \n"), Err(Error::EmptyOutput)));
        assert!(matches!(
            ResultParser::parse("not json at all"),
            Err(Error::Parse { .. })
        ));
        assert!(matches!(ResultParser::parse("[1,2]"), Err(Error::Parse { .. })));
    }

    #[test]
    fn test_result_tolerates_leading_diagnostics() {
        let output = "Warning: update available\n{\"result\":\"ok\",\"is_error\":false}\n";
        let messages = ResultParser::parse(output).unwrap();
        assert_eq!(messages.last().unwrap().text().as_deref(), Some("ok"));
    }

    #[test]
    fn test_object_split_across_three_lines() {
        let mut parser = StreamingParser::new(OutputFormat::StreamJson);
        assert!(parser.feed(r#"{"type":"result","#).is_none());
        assert_eq!(parser.state(), ParserState::Buffering);
        assert!(parser.feed(r#""result":"done","#).is_none());
        let message = parser.feed(r#""is_error":false}"#).unwrap();
        assert_eq!(parser.state(), ParserState::NoBuffer);
        assert_eq!(message.as_result().unwrap().result.as_deref(), Some("done"));
        assert!(parser.finish().unwrap().is_empty());
    }

    #[test]
    fn test_stream_json_events_in_order_skipping_noise() {
        let lines = [
            r#"{"type":"system","subtype":"init","session_id":"s1","model":"m","tools":["Read","Bash"]}"#,
            "some diagnostic output",
            r#"{"type":"assistant","message":{"model":"m","content":[{"type":"text","text":"Hi"},{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"a"}}]},"session_id":"s1"}"#,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"data"}]}}"#,
            r#"{"type":"mystery"}"#,
            "",
            r#"{"type":"result","result":"Hi","is_error":false,"num_turns":1}"#,
        ];
        let messages: Vec<Message> = StreamingParser::new(OutputFormat::StreamJson)
            .messages(lines)
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(messages.len(), 4);
        match &messages[0] {
            Message::System(system) => {
                assert_eq!(system.subtype, "init");
                assert_eq!(system.tools, ["Read", "Bash"]);
            }
            other => panic!("expected system, got {:?}", other),
        }
        assert_eq!(messages[1].text().as_deref(), Some("Hi"));
        assert_eq!(messages[1].tool_uses()[0].name, "Read");
        assert!(matches!(&messages[2], Message::User(u) if matches!(u.content[0], ContentBlock::ToolResult(_))));
        assert!(messages[3].is_result());
    }

    #[test]
    fn test_broken_fragment_discarded_and_next_line_reparsed() {
        let mut parser = StreamingParser::new(OutputFormat::StreamJson);
        assert!(parser.feed(r#"{"type":"assistant","#).is_none());
        let message = parser.feed(r#"{"type":"result","result":"x"}"#).unwrap();
        assert!(message.is_result());
        assert_eq!(parser.state(), ParserState::NoBuffer);
    }

    #[test]
    fn test_json_lines_residual_dropped_on_close() {
        let mut parser = StreamingParser::new(OutputFormat::StreamJson);
        parser.feed(r#"{"type":"result","#);
        assert!(parser.finish().unwrap().is_empty());
    }

    #[test]
    fn test_text_mode_flushes_single_result_on_close() {
        let mut parser = StreamingParser::new(OutputFormat::Text);
        assert!(parser.feed("line one").is_none());
        assert!(parser.feed("{\"looks\":\"like json\"}").is_none());
        let messages = parser.finish().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].as_result().unwrap().result.as_deref(),
            Some("line one\n{\"looks\":\"like json\"}")
        );
    }

    #[test]
    fn test_text_mode_empty_output_still_yields_result() {
        let mut parser = StreamingParser::new(OutputFormat::Text);
        let messages = parser.finish().unwrap();
        assert_eq!(messages.len(), 1);
        let result = messages[0].as_result().unwrap();
        assert_eq!(result.result.as_deref(), Some(""));
        assert!(!result.is_error);
    }

    #[test]
    fn test_json_format_through_streaming_parser() {
        let lines = ["{", r#"  "result": "pretty","#, r#"  "is_error": false"#, "}"];
        let messages: Vec<Message> = StreamingParser::new(OutputFormat::Json)
            .messages(lines)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text().as_deref(), Some("pretty"));
    }

    #[test]
    fn test_json_format_empty_surfaces_error() {
        let mut iter = StreamingParser::new(OutputFormat::Json).messages(Vec::<String>::new());
        assert!(matches!(iter.next(), Some(Err(Error::EmptyOutput))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_user_content_as_string() {
        let message = MessageParser::parse_line(r#"{"type":"user","content":"hello"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(message.text().as_deref(), Some("hello"));
    }
}
