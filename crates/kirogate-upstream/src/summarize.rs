//! AI-assisted history summarization over the normal streaming call.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use kirogate_protocol::UpstreamEvent;
use kirogate_translate::conversation::{
    ConversationState, CurrentMessage, GenerateAssistantResponseRequest, UserInputMessage,
    CHAT_TRIGGER_MANUAL,
};
use kirogate_translate::prune::{SummarizeError, Summarizer};

use crate::UpstreamClient;

const SUMMARIZE_PROMPT: &str = "Summarize the conversation below task by task. \
For each task the user raised, state what was asked, what was done, and the outcome. \
Keep file paths, identifiers, and decisions verbatim. Reply with the summary only.";

/// Per-request summarizer bound to an already-selected account token.
pub struct UpstreamSummarizer {
    client: Arc<UpstreamClient>,
    access_token: String,
    model_id: String,
    profile_arn: Option<String>,
}

impl UpstreamSummarizer {
    pub fn new(
        client: Arc<UpstreamClient>,
        access_token: String,
        model_id: String,
        profile_arn: Option<String>,
    ) -> Self {
        Self {
            client,
            access_token,
            model_id,
            profile_arn,
        }
    }
}

#[async_trait]
impl Summarizer for UpstreamSummarizer {
    async fn summarize(&self, transcript: &str) -> Result<String, SummarizeError> {
        let request = GenerateAssistantResponseRequest {
            conversation_state: ConversationState {
                conversation_id: Uuid::new_v4().to_string(),
                agent_continuation_id: None,
                agent_task_type: None,
                chat_trigger_type: CHAT_TRIGGER_MANUAL.to_string(),
                history: Vec::new(),
                current_message: CurrentMessage {
                    user_input_message: UserInputMessage::new(
                        format!("{SUMMARIZE_PROMPT}\n\n{transcript}"),
                        &self.model_id,
                    ),
                },
            },
            profile_arn: self.profile_arn.clone(),
        };

        let mut rx = self
            .client
            .send_generate(&request, &self.access_token, CancellationToken::new())
            .await
            .map_err(|e| SummarizeError::Upstream(e.to_string()))?;

        let mut summary = String::new();
        while let Some(event) = rx.recv().await {
            match event {
                UpstreamEvent::Content { content } => summary.push_str(&content),
                UpstreamEvent::Error { code, message } => {
                    return Err(SummarizeError::Upstream(format!("{code}: {message}")))
                }
                _ => {}
            }
        }
        Ok(summary)
    }
}
