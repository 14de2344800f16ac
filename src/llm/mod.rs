//! LLM Turn Engine (spec.md §4.4): system prompt composition, chat
//! history bookkeeping, and tool-call auto-invocation on top of an
//! OpenAI-wire-format chat-completion endpoint.

pub mod client;
pub mod tools;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use client::{
    ChatCompletionRequest, ChatMessage, LlmClient, ToolCallWire, ToolFunctionSchema, ToolSchema,
};
use tools::ToolRegistry;

const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 1024;
const MAX_TOOL_HOPS: u32 = 8;

#[derive(Debug, Clone)]
pub enum ChatTurn {
    System(String),
    User(String),
    Assistant {
        text: Option<String>,
        tool_calls: Vec<ToolCallWire>,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

pub struct TurnEngineConfig {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub instructions: String,
    pub instructions_addendum: String,
    pub tool_guidance_template: String,
    pub extensions: Vec<ExtensionEntry>,
}

#[derive(Debug, Clone)]
pub struct ExtensionEntry {
    pub name: String,
    pub number: String,
    pub description: String,
}

fn render_extensions(extensions: &[ExtensionEntry]) -> String {
    extensions
        .iter()
        .map(|e| format!("{} ({}) - {}", e.name, e.number, e.description))
        .collect::<Vec<_>>()
        .join(", ")
}

fn compose_system_prompt(config: &TurnEngineConfig, tools: &ToolRegistry) -> String {
    let tool_guidance = config
        .tool_guidance_template
        .replace("{extensions}", &render_extensions(&config.extensions));

    let mut prompt = format!(
        "{}{}{}",
        config.instructions, config.instructions_addendum, tool_guidance
    );

    if !tools.is_empty() {
        prompt.push_str("\n\nAvailable tools:\n");
        for tool in tools.iter() {
            prompt.push_str(&format!("- {}: {}\n", tool.name(), tool.description()));
            for param in tool.parameters() {
                prompt.push_str(&format!(
                    "    {} ({}, {}{}): {}\n",
                    param.name,
                    param.kind,
                    if param.required { "required" } else { "optional" },
                    param
                        .default
                        .map(|d| format!(", default={d}"))
                        .unwrap_or_default(),
                    param.description
                ));
            }
        }
    }

    prompt
}

fn tool_schemas(tools: &ToolRegistry) -> Vec<ToolSchema> {
    tools
        .iter()
        .map(|tool| {
            let mut properties = serde_json::Map::new();
            let mut required = Vec::new();
            for param in tool.parameters() {
                properties.insert(
                    param.name.to_string(),
                    json!({ "type": param.kind, "description": param.description }),
                );
                if param.required {
                    required.push(param.name);
                }
            }
            ToolSchema {
                kind: "function".to_string(),
                function: ToolFunctionSchema {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: json!({
                        "type": "object",
                        "properties": Value::Object(properties),
                        "required": required,
                    }),
                },
            }
        })
        .collect()
}

fn to_wire_message(turn: &ChatTurn) -> ChatMessage {
    match turn {
        ChatTurn::System(text) => ChatMessage {
            role: "system".to_string(),
            content: Some(text.clone()),
            tool_call_id: None,
            tool_calls: None,
        },
        ChatTurn::User(text) => ChatMessage {
            role: "user".to_string(),
            content: Some(text.clone()),
            tool_call_id: None,
            tool_calls: None,
        },
        ChatTurn::Assistant { text, tool_calls } => ChatMessage {
            role: "assistant".to_string(),
            content: text.clone(),
            tool_call_id: None,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls.clone())
            },
        },
        ChatTurn::ToolResult {
            tool_call_id,
            content,
        } => ChatMessage {
            role: "tool".to_string(),
            content: Some(content.clone()),
            tool_call_id: Some(tool_call_id.clone()),
            tool_calls: None,
        },
    }
}

pub struct TurnEngine {
    client: Arc<dyn LlmClient>,
    config: TurnEngineConfig,
    tools: ToolRegistry,
    system_prompt: String,
    history: Mutex<Vec<ChatTurn>>,
}

impl TurnEngine {
    pub fn new(client: Arc<dyn LlmClient>, config: TurnEngineConfig, tools: ToolRegistry) -> Self {
        let system_prompt = compose_system_prompt(&config, &tools);
        let history = Mutex::new(vec![ChatTurn::System(system_prompt.clone())]);
        Self {
            client,
            config,
            tools,
            system_prompt,
            history,
        }
    }

    /// Re-appends the system turn; used to seed history on call start and
    /// by `clear_history`.
    pub async fn clear_history(&self) {
        let mut history = self.history.lock().await;
        history.clear();
        history.push(ChatTurn::System(self.system_prompt.clone()));
    }

    /// Seed the welcome line directly into history without invoking the model.
    pub async fn add_assistant_message(&self, text: impl Into<String>) {
        let mut history = self.history.lock().await;
        history.push(ChatTurn::Assistant {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        });
    }

    pub async fn history_snapshot(&self) -> Vec<ChatTurn> {
        self.history.lock().await.clone()
    }

    /// One-shot turn: append the user message, invoke the model (with
    /// tool-call auto-invocation), append the assistant reply, and return
    /// the speakable text. Any failure is caught and turned into a
    /// fallback assistant response so the caller always gets a string to
    /// speak (spec.md §4.4 / §7 `LLMFailure`).
    pub async fn process_message(&self, user_text: &str) -> String {
        {
            let mut history = self.history.lock().await;
            history.push(ChatTurn::User(user_text.to_string()));
        }

        match self.run_model_loop().await {
            Ok(text) => text,
            Err(reason) => {
                let fallback = format!("Error in processing: {reason}. Falling back to basic chat.");
                let mut history = self.history.lock().await;
                history.push(ChatTurn::Assistant {
                    text: Some(fallback.clone()),
                    tool_calls: Vec::new(),
                });
                fallback
            }
        }
    }

    async fn run_model_loop(&self) -> Result<String, String> {
        let tools = if self.tools.is_empty() {
            None
        } else {
            Some(tool_schemas(&self.tools))
        };

        for _hop in 0..MAX_TOOL_HOPS {
            let messages = {
                let history = self.history.lock().await;
                history.iter().map(to_wire_message).collect::<Vec<_>>()
            };

            let request = ChatCompletionRequest {
                model: self.config.model.clone(),
                messages,
                temperature: self.config.temperature.unwrap_or(DEFAULT_TEMPERATURE),
                max_tokens: self.config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                tools: tools.clone(),
                tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            };

            let response = self
                .client
                .complete(request)
                .await
                .map_err(|e| e.to_string())?;

            let message = response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| "model returned no choices".to_string())?
                .message;

            let tool_calls = message.tool_calls.unwrap_or_default();
            if tool_calls.is_empty() {
                let text = message.content.unwrap_or_default();
                let mut history = self.history.lock().await;
                history.push(ChatTurn::Assistant {
                    text: Some(text.clone()),
                    tool_calls: Vec::new(),
                });
                return Ok(text);
            }

            {
                let mut history = self.history.lock().await;
                history.push(ChatTurn::Assistant {
                    text: message.content.clone(),
                    tool_calls: tool_calls.clone(),
                });
            }

            for call in &tool_calls {
                let result = self.invoke_tool(call).await;
                let mut history = self.history.lock().await;
                history.push(ChatTurn::ToolResult {
                    tool_call_id: call.id.clone(),
                    content: result,
                });
            }
        }

        Err("exceeded maximum tool-call hops".to_string())
    }

    async fn invoke_tool(&self, call: &ToolCallWire) -> String {
        let Some(tool) = self.tools.get(&call.function.name) else {
            return json!({ "error": "unknown_tool", "details": call.function.name }).to_string();
        };
        let args: HashMap<String, String> =
            serde_json::from_str(&call.function.arguments).unwrap_or_default();
        tool.invoke(&args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use client::{ChatChoice, ChatCompletionResponse, LlmError, ResponseMessage};

    struct FakeClient {
        responses: Mutex<Vec<ChatCompletionResponse>>,
    }

    #[async_trait::async_trait]
    impl LlmClient for FakeClient {
        async fn complete(
            &self,
            _request: ChatCompletionRequest,
        ) -> Result<ChatCompletionResponse, LlmError> {
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                return Err(LlmError::Http("no more canned responses".to_string()));
            }
            Ok(responses.remove(0))
        }
    }

    fn plain_response(text: &str) -> ChatCompletionResponse {
        ChatCompletionResponse {
            choices: vec![ChatChoice {
                message: ResponseMessage {
                    content: Some(text.to_string()),
                    tool_calls: None,
                },
            }],
        }
    }

    fn base_config() -> TurnEngineConfig {
        TurnEngineConfig {
            model: "gpt-4o-mini".to_string(),
            temperature: None,
            max_tokens: None,
            instructions: "You are a helpful phone assistant.".to_string(),
            instructions_addendum: String::new(),
            tool_guidance_template: "Transfer extensions: {extensions}".to_string(),
            extensions: vec![ExtensionEntry {
                name: "Caleb".to_string(),
                number: "102".to_string(),
                description: "personal line".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn history_begins_with_exactly_one_system_turn() {
        let client = Arc::new(FakeClient {
            responses: Mutex::new(vec![]),
        });
        let engine = TurnEngine::new(client, base_config(), ToolRegistry::new());
        let history = engine.history_snapshot().await;
        assert_eq!(history.len(), 1);
        assert!(matches!(history[0], ChatTurn::System(_)));
    }

    #[tokio::test]
    async fn clear_history_restores_single_system_turn() {
        let client = Arc::new(FakeClient {
            responses: Mutex::new(vec![plain_response("hi")]),
        });
        let engine = TurnEngine::new(client, base_config(), ToolRegistry::new());
        engine.process_message("hello").await;
        engine.clear_history().await;
        let history = engine.history_snapshot().await;
        assert_eq!(history.len(), 1);
        assert!(matches!(history[0], ChatTurn::System(_)));
    }

    #[tokio::test]
    async fn process_message_returns_assistant_text() {
        let client = Arc::new(FakeClient {
            responses: Mutex::new(vec![plain_response("It's 3pm.")]),
        });
        let engine = TurnEngine::new(client, base_config(), ToolRegistry::new());
        let reply = engine.process_message("What time is it").await;
        assert_eq!(reply, "It's 3pm.");
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_speakable_error() {
        let client = Arc::new(FakeClient {
            responses: Mutex::new(vec![]),
        });
        let engine = TurnEngine::new(client, base_config(), ToolRegistry::new());
        let reply = engine.process_message("hello").await;
        assert!(reply.starts_with("Error in processing:"));
        assert!(reply.ends_with("Falling back to basic chat."));
    }

    #[tokio::test]
    async fn tool_guidance_template_substitutes_extensions() {
        let prompt = compose_system_prompt(&base_config(), &ToolRegistry::new());
        assert!(prompt.contains("Caleb (102) - personal line"));
    }
}
