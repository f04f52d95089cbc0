//! Post-step plan review. Conservative by default: the common outcome is
//! "keep the plan"; after a failure the reviewer may insert diagnostic steps,
//! and it may drop steps the finished work made redundant.

use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use dotbot_llm::{ChatMessage, ChatOptions, LlmError, ResilientClient, Role, extract_json};

use crate::plan::{PlanStep, StepPlan, progress_summary};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct ReplanReply {
    action: String,
    insert_steps: Vec<InsertStep>,
    drop_step_titles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct InsertStep {
    title: String,
    description: String,
    expected_output: String,
    tool_ids: Vec<String>,
}

/// Review the plan after a step. Mutates `plan` in place; the caller flushes
/// `plan.json` afterwards. Any decode trouble means "keep".
pub async fn review_plan(
    llm: &ResilientClient,
    plan: &mut StepPlan,
    finished_step_title: &str,
    step_output: &str,
    step_failed: bool,
    workspace_listing: &str,
    manifest_tool_ids: &[String],
) -> Result<(), LlmError> {
    if plan.progress.remaining.is_empty() {
        return Ok(());
    }

    let messages = vec![
        ChatMessage::system(
            "Review a step plan after one step finished. Reply with JSON: \
             {\"action\": \"keep\"|\"revise\", \"insert_steps\": [{\"title\", \
             \"description\", \"expected_output\", \"tool_ids\"}], \
             \"drop_step_titles\": [str]}. Keep the plan unless the step outcome \
             clearly demands a change; after a failure consider one diagnostic \
             step (e.g. read the logs); drop steps the finished work already \
             covers.",
        ),
        ChatMessage::user(format!(
            "PLAN APPROACH: {}\n{}\nFINISHED STEP: {finished_step_title} ({})\n\
             STEP OUTPUT:\n{step_output}\n\nWORKSPACE:\n{workspace_listing}",
            plan.approach,
            progress_summary(plan),
            if step_failed { "FAILED" } else { "ok" },
        )),
    ];

    let response = llm
        .chat(Role::Workhorse, &messages, &ChatOptions::default())
        .await?;
    let Some(reply) = extract_json::<ReplanReply>(&response.content) else {
        warn!("re-planner returned no parseable JSON — keeping the plan");
        return Ok(());
    };
    if reply.action != "revise" {
        return Ok(());
    }

    // Drop named remaining steps (never completed ones).
    if !reply.drop_step_titles.is_empty() {
        let drop_ids: Vec<String> = plan
            .steps
            .iter()
            .filter(|s| {
                reply.drop_step_titles.contains(&s.title)
                    && plan.progress.remaining.contains(&s.id)
            })
            .map(|s| s.id.clone())
            .collect();
        for id in &drop_ids {
            info!(step = %id, "re-planner dropped redundant step");
            plan.progress.remaining.retain(|s| s != id);
        }
        plan.steps.retain(|s| !drop_ids.contains(&s.id));
    }

    // Insert new steps at the front of the remaining queue, preserving their
    // given order.
    for insert in reply.insert_steps.into_iter().rev() {
        if insert.title.trim().is_empty() {
            continue;
        }
        let step = PlanStep {
            id: format!("step-{}", Uuid::new_v4().simple()),
            title: insert.title,
            description: insert.description,
            expected_output: insert.expected_output,
            tool_ids: insert
                .tool_ids
                .into_iter()
                .filter(|id| manifest_tool_ids.contains(id))
                .collect(),
            needs_external_data: false,
        };
        info!(step = %step.title, "re-planner inserted step");
        plan.progress.remaining.insert(0, step.id.clone());
        plan.steps.push(step);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotbot_llm::{
        ApiKeys, ChatResponse, LlmClient, Provider, ProviderRegistry,
    };
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct OneShotClient {
        content: String,
    }

    #[async_trait]
    impl LlmClient for OneShotClient {
        fn provider(&self) -> Provider {
            Provider::Deepseek
        }
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> Result<ChatResponse, LlmError> {
            Ok(ChatResponse {
                provider: Provider::Deepseek,
                model: "deepseek-chat".to_string(),
                content: self.content.clone(),
                tool_calls: vec![],
                finish_reason: "stop".to_string(),
                reasoning_content: None,
                usage: None,
            })
        }
        async fn stream(
            &self,
            messages: &[ChatMessage],
            options: &ChatOptions,
            _tx: mpsc::Sender<String>,
        ) -> Result<ChatResponse, LlmError> {
            self.chat(messages, options).await
        }
    }

    async fn llm_replying(content: &str) -> ResilientClient {
        let keys = ApiKeys::default().with_key(Provider::Deepseek, "k");
        let registry = Arc::new(ProviderRegistry::new(keys));
        registry
            .insert(
                Provider::Deepseek,
                Arc::new(OneShotClient { content: content.to_string() }),
            )
            .await;
        ResilientClient::new(registry)
    }

    fn two_step_plan() -> StepPlan {
        let steps: Vec<PlanStep> = ["gather", "write"]
            .into_iter()
            .map(|title| PlanStep {
                id: format!("step-{title}"),
                title: title.to_string(),
                description: title.to_string(),
                expected_output: "out".to_string(),
                tool_ids: vec![],
                needs_external_data: false,
            })
            .collect();
        let remaining = steps.iter().map(|s| s.id.clone()).collect();
        StepPlan {
            approach: "two steps".to_string(),
            steps,
            progress: crate::plan::PlanProgress {
                remaining,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn keep_leaves_the_plan_untouched() {
        let llm = llm_replying(r#"{"action":"keep"}"#).await;
        let mut plan = two_step_plan();
        review_plan(&llm, &mut plan, "gather", "found it", false, "(empty)", &[])
            .await
            .unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.progress.remaining.len(), 2);
    }

    #[tokio::test]
    async fn garbage_reply_defaults_to_keep() {
        let llm = llm_replying("sure, sounds good!").await;
        let mut plan = two_step_plan();
        review_plan(&llm, &mut plan, "gather", "ok", false, "(empty)", &[])
            .await
            .unwrap();
        assert_eq!(plan.steps.len(), 2);
    }

    #[tokio::test]
    async fn failure_can_insert_a_diagnostic_step_first() {
        let llm = llm_replying(
            r#"{"action":"revise","insert_steps":[{"title":"read logs",
                "description":"inspect the failure output","expected_output":"root cause",
                "tool_ids":["fs.read_file"]}]}"#,
        )
        .await;
        let mut plan = two_step_plan();
        review_plan(
            &llm,
            &mut plan,
            "gather",
            "Error: exploded",
            true,
            "(empty)",
            &["fs.read_file".to_string()],
        )
        .await
        .unwrap();

        assert_eq!(plan.steps.len(), 3);
        let first_remaining = plan.progress.remaining[0].clone();
        assert_eq!(plan.step(&first_remaining).unwrap().title, "read logs");
    }

    #[tokio::test]
    async fn redundant_remaining_steps_are_dropped_but_completed_stay() {
        let llm = llm_replying(r#"{"action":"revise","drop_step_titles":["write","gather"]}"#).await;
        let mut plan = two_step_plan();
        // "gather" already completed; only remaining "write" may be dropped.
        plan.complete_step("step-gather");

        review_plan(&llm, &mut plan, "gather", "done", false, "(empty)", &[])
            .await
            .unwrap();
        assert!(plan.progress.remaining.is_empty());
        assert_eq!(plan.progress.completed, vec!["step-gather"]);
        assert!(plan.step("step-gather").is_some());
        assert!(plan.step("step-write").is_none());
    }
}
