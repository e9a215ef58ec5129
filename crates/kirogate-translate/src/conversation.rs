//! CodeWhisperer `conversationState` wire types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ORIGIN_AI_EDITOR: &str = "AI_EDITOR";
pub const CHAT_TRIGGER_MANUAL: &str = "MANUAL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateAssistantResponseRequest {
    pub conversation_state: ConversationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_continuation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_task_type: Option<String>,
    pub chat_trigger_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
    pub current_message: CurrentMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HistoryEntry {
    User {
        #[serde(rename = "userInputMessage")]
        user_input_message: UserInputMessage,
    },
    Assistant {
        #[serde(rename = "assistantResponseMessage")]
        assistant_response_message: AssistantResponseMessage,
    },
}

impl HistoryEntry {
    pub fn is_user(&self) -> bool {
        matches!(self, HistoryEntry::User { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMessage {
    pub user_input_message: UserInputMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessage {
    pub content: String,
    pub model_id: String,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input_message_context: Option<UserInputMessageContext>,
}

impl UserInputMessage {
    pub fn new(content: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model_id: model_id.into(),
            origin: ORIGIN_AI_EDITOR.to_string(),
            images: Vec::new(),
            user_input_message_context: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessageContext {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<UpstreamToolResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<UpstreamTool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supplemental_contexts: Vec<SupplementalContext>,
}

impl UserInputMessageContext {
    pub fn is_empty(&self) -> bool {
        self.tool_results.is_empty() && self.tools.is_empty() && self.supplemental_contexts.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamToolResult {
    pub tool_use_id: String,
    pub content: Vec<ToolResultContentBlock>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultContentBlock {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamTool {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSchema {
    pub json: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplementalContext {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_uses: Vec<UpstreamToolUse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBlock {
    pub format: String,
    pub source: ImageSourceBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSourceBlock {
    pub bytes: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_entries_serialize_with_the_right_wrapper() {
        let user = HistoryEntry::User {
            user_input_message: UserInputMessage::new("hi", "MODEL"),
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(json.contains("\"userInputMessage\""));
        assert!(json.contains("\"origin\":\"AI_EDITOR\""));

        let asst = HistoryEntry::Assistant {
            assistant_response_message: AssistantResponseMessage {
                content: "yo".into(),
                tool_uses: Vec::new(),
            },
        };
        let json = serde_json::to_string(&asst).unwrap();
        assert!(json.contains("\"assistantResponseMessage\""));
        assert!(!json.contains("toolUses"));
    }

    #[test]
    fn empty_optionals_are_omitted() {
        let msg = UserInputMessage::new("x", "m");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("images"));
        assert!(!json.contains("userInputMessageContext"));
    }
}
