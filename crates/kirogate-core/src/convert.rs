//! Inbound request translation: OpenAI chat bodies normalize onto the
//! Anthropic shape, and Anthropic bodies translate into the upstream
//! conversation-state request.

use serde_json::{Value, json};
use uuid::Uuid;

use kirogate_protocol::anthropic::{MessagesRequest, SystemPrompt, Thinking};
use kirogate_protocol::openai::{ChatCompletionRequest, ChatMessage};

use crate::error::GatewayError;

/// Directive prepended to the system text when extended thinking is on; the
/// upstream model answers with tagged reasoning the extractor strips back
/// out.
pub fn thinking_prefix(thinking: Option<&Thinking>) -> String {
    match thinking {
        Some(thinking) if thinking.is_enabled() => format!(
            "<thinking_mode>enabled</thinking_mode><max_thinking_length>{}</max_thinking_length>",
            thinking.normalized_budget()
        ),
        _ => String::new(),
    }
}

pub fn has_thinking_tags(content: &str) -> bool {
    content.contains("<thinking_mode>") || content.contains("<max_thinking_length>")
}

/// Map public model names onto upstream model ids; unknown names pass
/// through unchanged.
pub fn map_model_id(model: &str) -> String {
    let base = model.strip_suffix("-thinking").unwrap_or(model);
    let mapped = if base.contains("sonnet-4-5") {
        "CLAUDE_SONNET_4_5_20250929_V1_0"
    } else if base.contains("sonnet-4") {
        "CLAUDE_SONNET_4_20250514_V1_0"
    } else if base.contains("haiku-4-5") {
        "CLAUDE_HAIKU_4_5_20251001_V1_0"
    } else if base.contains("3-7-sonnet") {
        "CLAUDE_3_7_SONNET_20250219_V1_0"
    } else {
        return base.to_string();
    };
    mapped.to_string()
}

/// A `-thinking` model suffix turns extended thinking on even when the body
/// carries no thinking config.
pub fn override_thinking_from_model(request: &mut MessagesRequest) {
    if !request.model.ends_with("-thinking") {
        return;
    }
    if request.thinking.as_ref().is_some_and(Thinking::is_enabled) {
        return;
    }
    request.thinking = Some(Thinking {
        kind: "enabled".to_string(),
        budget_tokens: 0,
    });
}

/// Flatten one Anthropic message content value to plain text.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| match block.get("type").and_then(Value::as_str) {
                Some("text") => block.get("text").and_then(Value::as_str).map(str::to_string),
                Some("tool_result") => Some(tool_result_text(block)),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn tool_result_text(block: &Value) -> String {
    match block.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn tool_results(content: &Value) -> Vec<Value> {
    let Value::Array(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
        .map(|block| {
            let status = if block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                "error"
            } else {
                "success"
            };
            json!({
                "toolUseId": block.get("tool_use_id").cloned().unwrap_or(Value::Null),
                "content": [{"text": tool_result_text(block)}],
                "status": status,
            })
        })
        .collect()
}

fn assistant_tool_uses(content: &Value) -> Vec<Value> {
    let Value::Array(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
        .map(|block| {
            json!({
                "toolUseId": block.get("id").cloned().unwrap_or(Value::Null),
                "name": block.get("name").cloned().unwrap_or(Value::Null),
                "input": block.get("input").cloned().unwrap_or(Value::Null),
            })
        })
        .collect()
}

fn user_message(content: &Value, model_id: &str, extra_prefix: &str, tools: &[Value]) -> Value {
    let mut text = content_text(content);
    if !extra_prefix.is_empty() {
        text = if text.is_empty() {
            extra_prefix.to_string()
        } else {
            format!("{extra_prefix}\n\n{text}")
        };
    }

    let mut context = serde_json::Map::new();
    if !tools.is_empty() {
        context.insert("tools".to_string(), Value::Array(tools.to_vec()));
    }
    let results = tool_results(content);
    if !results.is_empty() {
        context.insert("toolResults".to_string(), Value::Array(results));
    }

    json!({
        "userInputMessage": {
            "content": text,
            "modelId": model_id,
            "origin": "AI_EDITOR",
            "userInputMessageContext": Value::Object(context),
        }
    })
}

fn assistant_message(content: &Value) -> Value {
    let tool_uses = assistant_tool_uses(content);
    let mut message = serde_json::Map::new();
    message.insert(
        "content".to_string(),
        Value::String(content_text(content)),
    );
    if !tool_uses.is_empty() {
        message.insert("toolUses".to_string(), Value::Array(tool_uses));
    }
    json!({ "assistantResponseMessage": Value::Object(message) })
}

/// Translate an Anthropic messages body into the upstream
/// conversation-state request.
pub fn build_upstream_body(
    request: &MessagesRequest,
    profile_arn: Option<&str>,
) -> Result<Value, GatewayError> {
    if request.model.is_empty() {
        return Err(GatewayError::invalid_request("missing model"));
    }
    let Some((current, history_messages)) = request.messages.split_last() else {
        return Err(GatewayError::invalid_request("messages must not be empty"));
    };
    if current.role != "user" {
        return Err(GatewayError::invalid_request(
            "last message must have role user",
        ));
    }

    let model_id = map_model_id(&request.model);

    let tools: Vec<Value> = request
        .tools
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|tool| {
            json!({
                "toolSpecification": {
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": {"json": tool.input_schema},
                }
            })
        })
        .collect();

    // System text plus the thinking directive travel ahead of the current
    // message content.
    let mut prefix = thinking_prefix(request.thinking.as_ref());
    if let Some(system) = &request.system {
        let system_text = system.joined();
        if !system_text.is_empty() && !has_thinking_tags(&system_text) {
            if prefix.is_empty() {
                prefix = system_text;
            } else {
                prefix = format!("{prefix}\n{system_text}");
            }
        }
    }

    let mut history = Vec::new();
    for message in history_messages {
        match message.role.as_str() {
            "user" => history.push(user_message(&message.content, &model_id, "", &[])),
            "assistant" => history.push(assistant_message(&message.content)),
            _ => {}
        }
    }

    let mut body = json!({
        "conversationState": {
            "chatTriggerType": "MANUAL",
            "conversationId": Uuid::new_v4().to_string(),
            "currentMessage": user_message(&current.content, &model_id, &prefix, &tools),
            "history": history,
        }
    });
    if let Some(arn) = profile_arn {
        body["profileArn"] = Value::String(arn.to_string());
    }
    Ok(body)
}

/// Normalize an OpenAI chat-completions body onto the Anthropic request
/// shape consumed by the rest of the pipeline.
pub fn chat_to_messages(request: ChatCompletionRequest) -> MessagesRequest {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                let text = openai_content_text(message);
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "assistant" => messages.push(kirogate_protocol::anthropic::Message {
                role: "assistant".to_string(),
                content: assistant_content(message),
            }),
            "tool" => messages.push(kirogate_protocol::anthropic::Message {
                role: "user".to_string(),
                content: json!([{
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id,
                    "content": openai_content_text(message),
                }]),
            }),
            _ => messages.push(kirogate_protocol::anthropic::Message {
                role: "user".to_string(),
                content: Value::String(openai_content_text(message)),
            }),
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| kirogate_protocol::anthropic::Tool {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                input_schema: tool.function.parameters.clone(),
            })
            .collect()
    });

    let mut normalized = MessagesRequest {
        model: request.model.clone(),
        max_tokens: request.output_budget().unwrap_or(4096),
        messages,
        system: (!system_parts.is_empty()).then(|| SystemPrompt::Text(system_parts.join("\n"))),
        tools,
        tool_choice: request.tool_choice.clone(),
        stream: request.stream,
        temperature: request.temperature,
        thinking: None,
        metadata: None,
    };
    override_thinking_from_model(&mut normalized);
    normalized
}

fn openai_content_text(message: &ChatMessage) -> String {
    match &message.content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn assistant_content(message: &ChatMessage) -> Value {
    let text = openai_content_text(message);
    let Some(tool_calls) = &message.tool_calls else {
        return Value::String(text);
    };

    let mut blocks = Vec::new();
    if !text.is_empty() {
        blocks.push(json!({"type": "text", "text": text}));
    }
    for call in tool_calls {
        let input: Value =
            serde_json::from_str(&call.function.arguments).unwrap_or(json!({}));
        blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.function.name,
            "input": input,
        }));
    }
    Value::Array(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kirogate_protocol::anthropic::Message;

    fn minimal_request(content: Value) -> MessagesRequest {
        MessagesRequest {
            model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens: 256,
            messages: vec![Message {
                role: "user".to_string(),
                content,
            }],
            system: None,
            tools: None,
            tool_choice: None,
            stream: true,
            temperature: None,
            thinking: None,
            metadata: None,
        }
    }

    #[test]
    fn thinking_prefix_matches_directive_format() {
        assert_eq!(thinking_prefix(None), "");
        let disabled = Thinking {
            kind: "disabled".to_string(),
            budget_tokens: 10_000,
        };
        assert_eq!(thinking_prefix(Some(&disabled)), "");

        let enabled = Thinking {
            kind: "enabled".to_string(),
            budget_tokens: 15_000,
        };
        assert_eq!(
            thinking_prefix(Some(&enabled)),
            "<thinking_mode>enabled</thinking_mode><max_thinking_length>15000</max_thinking_length>"
        );

        let oversized = Thinking {
            kind: "enabled".to_string(),
            budget_tokens: 50_000,
        };
        assert!(thinking_prefix(Some(&oversized)).contains("24576"));
    }

    #[test]
    fn detects_existing_thinking_tags() {
        assert!(has_thinking_tags("<thinking_mode>enabled</thinking_mode>"));
        assert!(has_thinking_tags("x <max_thinking_length>9</max_thinking_length>"));
        assert!(!has_thinking_tags("thinking_mode is not a tag"));
    }

    #[test]
    fn upstream_body_shape() {
        let mut request = minimal_request(Value::String("hello".to_string()));
        request.system = Some(SystemPrompt::Text("be terse".to_string()));
        let body = build_upstream_body(&request, Some("arn:profile")).unwrap();

        let state = &body["conversationState"];
        assert_eq!(state["chatTriggerType"], "MANUAL");
        let message = &state["currentMessage"]["userInputMessage"];
        assert_eq!(message["modelId"], "CLAUDE_SONNET_4_5_20250929_V1_0");
        assert_eq!(message["origin"], "AI_EDITOR");
        assert_eq!(message["content"], "be terse\n\nhello");
        assert_eq!(body["profileArn"], "arn:profile");
    }

    #[test]
    fn upstream_body_requires_trailing_user_message() {
        let mut request = minimal_request(Value::String("hi".to_string()));
        request.messages[0].role = "assistant".to_string();
        assert!(build_upstream_body(&request, None).is_err());

        request.messages.clear();
        assert!(build_upstream_body(&request, None).is_err());
    }

    #[test]
    fn history_alternates_user_and_assistant() {
        let mut request = minimal_request(Value::String("third".to_string()));
        request.messages.insert(
            0,
            Message {
                role: "assistant".to_string(),
                content: Value::String("second".to_string()),
            },
        );
        request.messages.insert(
            0,
            Message {
                role: "user".to_string(),
                content: Value::String("first".to_string()),
            },
        );

        let body = build_upstream_body(&request, None).unwrap();
        let history = body["conversationState"]["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["userInputMessage"]["content"], "first");
        assert_eq!(history[1]["assistantResponseMessage"]["content"], "second");
    }

    #[test]
    fn tools_become_tool_specifications() {
        let mut request = minimal_request(Value::String("hi".to_string()));
        request.tools = Some(vec![kirogate_protocol::anthropic::Tool {
            name: "get_weather".to_string(),
            description: "weather lookup".to_string(),
            input_schema: json!({"type":"object"}),
        }]);
        let body = build_upstream_body(&request, None).unwrap();
        let tools = &body["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["tools"];
        assert_eq!(tools[0]["toolSpecification"]["name"], "get_weather");
    }

    #[test]
    fn tool_results_carry_status() {
        let content = json!([
            {"type": "tool_result", "tool_use_id": "t1", "content": "ok", "is_error": false},
            {"type": "tool_result", "tool_use_id": "t2", "content": "boom", "is_error": true},
        ]);
        let request = minimal_request(content);
        let body = build_upstream_body(&request, None).unwrap();
        let results = &body["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["toolResults"];
        assert_eq!(results[0]["status"], "success");
        assert_eq!(results[1]["status"], "error");
    }

    #[test]
    fn chat_body_normalizes_onto_messages_shape() {
        let body = r#"{
            "model": "claude-sonnet-4-5",
            "stream": true,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "calling", "tool_calls": [
                    {"id": "c1", "type": "function",
                     "function": {"name": "lookup", "arguments": "{\"q\":1}"}}
                ]},
                {"role": "tool", "tool_call_id": "c1", "content": "result"},
                {"role": "user", "content": "continue"}
            ],
            "tools": [{"type": "function", "function": {
                "name": "lookup", "description": "d", "parameters": {"type": "object"}
            }}]
        }"#;
        let chat: ChatCompletionRequest = serde_json::from_str(body).unwrap();
        let normalized = chat_to_messages(chat);

        assert!(normalized.stream);
        assert_eq!(normalized.messages.len(), 4);
        assert_eq!(normalized.messages[1].role, "assistant");
        assert_eq!(
            normalized.messages[1].content[1]["type"],
            "tool_use"
        );
        assert_eq!(normalized.messages[2].content[0]["type"], "tool_result");
        assert_eq!(normalized.tools.as_ref().unwrap()[0].name, "lookup");
        assert!(matches!(normalized.system, Some(SystemPrompt::Text(ref t)) if t == "be brief"));
    }

    #[test]
    fn thinking_model_suffix_enables_thinking() {
        let body = r#"{"model":"claude-sonnet-4-5-thinking","messages":[{"role":"user","content":"x"}]}"#;
        let chat: ChatCompletionRequest = serde_json::from_str(body).unwrap();
        let normalized = chat_to_messages(chat);
        assert!(normalized.thinking_enabled());
        assert_eq!(map_model_id(&normalized.model), "CLAUDE_SONNET_4_5_20250929_V1_0");
    }
}
