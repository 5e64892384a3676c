//! Worker CLI `stream-json` output.
//!
//! Each stdout line is one event. [`SessionTranscript`] folds the events of a
//! session into what the orchestrator needs: session id, model, turn count
//! and the final result text.

use serde::Deserialize;
use serde_json::Value;

/// Events from the worker CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },

    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        num_turns: Option<u32>,
    },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Everything learned from one session's event stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionTranscript {
    pub session_id: Option<String>,
    pub model: Option<String>,
    /// Turn count reported by the result event, else assistant messages seen
    pub turns: u32,
    pub result: Option<String>,
    pub is_error: bool,
    /// Subtype of the result event (`success`, `error_max_turns`, ...)
    pub result_subtype: Option<String>,
    /// Concatenated assistant text, used when no result event arrives
    pub text: String,
    assistant_messages: u32,
}

impl SessionTranscript {
    /// Fold one stdout line. Lines that are not events are ignored.
    pub fn push_line(&mut self, line: &str) -> Option<StreamEvent> {
        let event: StreamEvent = serde_json::from_str(line.trim()).ok()?;
        match &event {
            StreamEvent::System {
                session_id, model, ..
            } => {
                if let Some(id) = session_id {
                    self.session_id.get_or_insert_with(|| id.clone());
                }
                if let Some(model) = model {
                    self.model.get_or_insert_with(|| model.clone());
                }
            }
            StreamEvent::Assistant {
                message,
                session_id,
            } => {
                self.assistant_messages += 1;
                if self.turns < self.assistant_messages {
                    self.turns = self.assistant_messages;
                }
                if let Some(id) = session_id {
                    self.session_id.get_or_insert_with(|| id.clone());
                }
                if let Some(model) = &message.model {
                    self.model.get_or_insert_with(|| model.clone());
                }
                for block in &message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            if !self.text.is_empty() {
                                self.text.push('\n');
                            }
                            self.text.push_str(text);
                        }
                        ContentBlock::ToolUse { name, input } => {
                            tracing::debug!(tool = %describe_tool_use(name, input), "Worker tool call");
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            StreamEvent::User {} => {}
            StreamEvent::Result {
                subtype,
                result,
                is_error,
                session_id,
                num_turns,
            } => {
                self.result = result.clone();
                self.is_error = *is_error;
                self.result_subtype = Some(subtype.clone());
                if let Some(id) = session_id {
                    self.session_id = Some(id.clone());
                }
                if let Some(turns) = num_turns {
                    self.turns = *turns;
                }
            }
        }
        Some(event)
    }

    pub fn from_output(output: &str) -> Self {
        let mut transcript = Self::default();
        for line in output.lines() {
            transcript.push_line(line);
        }
        transcript
    }

    /// The text the final payload is extracted from.
    pub fn final_text(&self) -> &str {
        self.result.as_deref().unwrap_or(&self.text)
    }
}

/// Short description of a tool call for debug logs
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(Value::as_str);
    match name {
        "Read" | "Write" | "Edit" => match field("file_path") {
            Some(path) => format!("{}: {}", name, path),
            None => name.to_string(),
        },
        "Bash" => format!("Bash: {}", truncate_str(field("command").unwrap_or(""), 60)),
        "Grep" | "Glob" => format!("{}: {}", name, field("pattern").unwrap_or("*")),
        _ => name.to_string(),
    }
}

fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
