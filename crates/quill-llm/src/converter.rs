use serde_json::{json, Value};

use quill_core::messages::{Message, Role};
use quill_core::tools::ToolInfo;

/// Generation options that shape the request body.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub instructions: Option<String>,
    pub max_output_tokens: Option<u32>,
    /// "low" | "medium" | "high"; only sent for reasoning models.
    pub reasoning_effort: Option<String>,
}

/// Build the Responses-API request body for a history and tool catalog.
pub fn build_request_body(
    model: &str,
    history: &[Message],
    tools: &[ToolInfo],
    options: &RequestOptions,
) -> Value {
    let mut body = json!({
        "model": model,
        "stream": true,
        "store": false,
        "input": convert_messages(history),
    });

    if let Some(instructions) = &options.instructions {
        body["instructions"] = json!(instructions);
    }
    if let Some(max) = options.max_output_tokens {
        body["max_output_tokens"] = json!(max);
    }
    if let Some(effort) = &options.reasoning_effort {
        body["reasoning"] = json!({ "effort": effort });
    }

    let tools = convert_tools(tools);
    if !tools.is_empty() {
        body["tools"] = json!(tools);
    }

    body
}

/// Flatten the conversation into Responses input items.
pub fn convert_messages(history: &[Message]) -> Vec<Value> {
    let mut items = Vec::new();

    for msg in history {
        match msg.role {
            Role::User => {
                let mut content = Vec::new();
                let text = msg.content();
                if !text.is_empty() {
                    content.push(json!({ "type": "input_text", "text": text }));
                }
                for attachment in msg.attachments() {
                    content.push(json!({
                        "type": "input_image",
                        "image_url": format!("data:{};base64,{}", attachment.mime_type, attachment.data),
                        "detail": "auto",
                    }));
                }
                items.push(json!({ "role": "user", "content": content }));
            }
            Role::Assistant => {
                let text = msg.content();
                if !text.is_empty() {
                    items.push(json!({
                        "role": "assistant",
                        "content": [{ "type": "output_text", "text": text }],
                    }));
                }
                for call in msg.tool_calls() {
                    if call.name.is_empty() {
                        continue;
                    }
                    items.push(json!({
                        "type": "function_call",
                        "call_id": call.id,
                        "name": call.name,
                        "arguments": call.input,
                    }));
                }
            }
            Role::Tool => {
                for result in msg.tool_results() {
                    items.push(json!({
                        "type": "function_call_output",
                        "call_id": result.tool_call_id,
                        "output": result.content,
                    }));
                }
            }
        }
    }

    items
}

pub fn convert_tools(tools: &[ToolInfo]) -> Vec<Value> {
    tools
        .iter()
        .filter(|t| !t.name.is_empty())
        .map(|t| {
            json!({
                "type": "function",
                "name": t.name,
                "description": t.description,
                "parameters": {
                    "type": "object",
                    "properties": t.parameters,
                    "required": t.required,
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::ids::{SessionId, ToolCallId};
    use quill_core::messages::{Attachment, ToolCall, ToolResult};

    fn sid() -> SessionId {
        SessionId::from_raw("s1")
    }

    #[test]
    fn user_text_and_image() {
        let msg = Message::user(
            sid(),
            "describe",
            vec![Attachment {
                name: "p.png".into(),
                mime_type: "image/png".into(),
                data: "AAAA".into(),
            }],
        );
        let items = convert_messages(&[msg]);
        assert_eq!(items[0]["role"], "user");
        assert_eq!(items[0]["content"][0]["type"], "input_text");
        assert_eq!(items[0]["content"][1]["image_url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn assistant_tool_calls_and_results_become_function_items() {
        let mut assistant = Message::assistant(sid(), None);
        assistant.append_content("Looking it up.");
        assistant.set_tool_calls(vec![ToolCall {
            id: ToolCallId::from_raw("call_9"),
            name: "fetch_url".into(),
            input: r#"{"url":"x"}"#.into(),
            finished: true,
        }]);
        let tool = Message::tool_results_message(
            sid(),
            vec![ToolResult {
                tool_call_id: ToolCallId::from_raw("call_9"),
                content: "page".into(),
                metadata: None,
                is_error: false,
            }],
        );

        let items = convert_messages(&[assistant, tool]);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["content"][0]["text"], "Looking it up.");
        assert_eq!(items[1]["type"], "function_call");
        assert_eq!(items[1]["call_id"], "call_9");
        assert_eq!(items[1]["arguments"], r#"{"url":"x"}"#);
        assert_eq!(items[2]["type"], "function_call_output");
        assert_eq!(items[2]["output"], "page");
    }

    #[test]
    fn tools_are_wrapped_in_object_schema() {
        let tools = vec![ToolInfo {
            name: "fetch_url".into(),
            description: "Fetch a page".into(),
            parameters: json!({ "url": { "type": "string" } }),
            required: vec!["url".into()],
        }];
        let body = build_request_body("gpt-5", &[], &tools, &RequestOptions::default());
        assert_eq!(body["stream"], true);
        assert_eq!(body["store"], false);
        assert_eq!(body["tools"][0]["parameters"]["type"], "object");
        assert_eq!(body["tools"][0]["parameters"]["required"][0], "url");
        assert!(body.get("reasoning").is_none());
    }

    #[test]
    fn optional_fields_only_when_set() {
        let options = RequestOptions {
            instructions: Some("be brief".into()),
            max_output_tokens: Some(512),
            reasoning_effort: Some("low".into()),
        };
        let body = build_request_body("gpt-5", &[], &[], &options);
        assert_eq!(body["instructions"], "be brief");
        assert_eq!(body["max_output_tokens"], 512);
        assert_eq!(body["reasoning"]["effort"], "low");
        assert!(body.get("tools").is_none());
    }
}
