//! Post-response background work: conversation summarization, executive
//! summary, and title generation. All of it is detached from the caller and
//! fails soft.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use cortex_core::traits::{NeuronSource, ToolRouter};
use cortex_core::types::{ChatMessage, LmRequest, ToolCallMeta};

pub struct BackgroundTasks {
    pub neurons: Arc<dyn NeuronSource>,
    pub tools: Arc<dyn ToolRouter>,
    pub worker_neuron_id: String,
    pub user_id: String,
    pub meta: ToolCallMeta,
}

impl BackgroundTasks {
    /// Kick off summarization, executive summary, and title generation.
    /// The tasks own their lifetime; a disconnecting caller does not cancel
    /// them, and none of them can fail the finished generation.
    pub fn spawn_all(self: Arc<Self>, question: String, answer: String) {
        let summary = self.clone();
        let summary_question = question.clone();
        let summary_answer = answer.clone();
        tokio::spawn(async move {
            summary
                .run(
                    "summarization",
                    format!(
                        "Summarize this exchange in at most three sentences, keeping names, \
                         decisions, and open questions.\n\nUser: {}\n\nAssistant: {}",
                        summary_question, summary_answer
                    ),
                    "history_set_summary",
                    "summary",
                )
                .await;
        });

        let executive = self.clone();
        let executive_answer = answer.clone();
        tokio::spawn(async move {
            executive
                .run(
                    "executive summary",
                    format!(
                        "Write a one-sentence executive summary of this answer:\n\n{}",
                        executive_answer
                    ),
                    "history_set_executive_summary",
                    "executiveSummary",
                )
                .await;
        });

        tokio::spawn(async move {
            self.run(
                "title generation",
                format!(
                    "Propose a short title (at most six words) for a conversation that \
                     starts with: {}",
                    question
                ),
                "history_set_title",
                "title",
            )
            .await;
        });
    }

    async fn run(&self, task: &str, prompt: String, tool: &str, field: &str) {
        let text = match self.worker_completion(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(task, error = %e, "Background task LM call failed");
                return;
            }
        };

        let args = json!({
            "conversationId": self.meta.conversation_id,
            field: text.trim(),
        });
        match self.tools.call_tool(tool, args, self.meta.clone()).await {
            Ok(_) => debug!(task, "Background task stored its result"),
            Err(e) => warn!(task, error = %e, "Background task persistence failed"),
        }
    }

    async fn worker_completion(&self, prompt: &str) -> cortex_core::error::Result<String> {
        let handle = self
            .neurons
            .model(&self.worker_neuron_id, &self.user_id)
            .await?;
        handle
            .complete(LmRequest {
                messages: vec![ChatMessage::user(prompt)],
                ..Default::default()
            })
            .await
    }
}
