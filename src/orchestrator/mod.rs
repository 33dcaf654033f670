//! Orchestration worker.
//!
//! Translates transcripts into enriched generation requests, persists both
//! sides of the conversation, and runs the proactive rules loop. Synthesis
//! dispatch happens inside the LLM worker per sentence, so this worker only
//! writes the assistant turn when the full response arrives.

pub mod prompts;
pub mod rules;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{decode_message, groups, streams, StreamBus};
use crate::config::OrchestratorSettings;
use crate::error::Result;
use crate::metrics::metrics;
use crate::pipeline::messages::{LlmRequest, LlmResponse, Role, Transcript};

use prompts::PromptBuilder;
use rules::{Rule, RulesEngine};
use state::ConversationStore;

/// Single device of the alpha deployment.
pub const DEFAULT_DEVICE_ID: &str = "companion-001";

/// History window handed to the model.
const HISTORY_WINDOW: usize = 10;

/// Reactive generation parameters: short replies for natural conversation.
const REACTIVE_MAX_TOKENS: u32 = 60;
const REACTIVE_TEMPERATURE: f32 = 0.7;

/// Proactive generation parameters: a little more room and warmth.
const PROACTIVE_MAX_TOKENS: u32 = 100;
const PROACTIVE_TEMPERATURE: f32 = 0.8;

/// Rules evaluation cadence.
const PROACTIVE_TICK: Duration = Duration::from_secs(60);

/// Run the orchestrator until shutdown.
///
/// # Errors
///
/// Returns an error if the store cannot be opened, the rules file is
/// malformed, or the bus is unreachable at startup.
pub async fn run(settings: &OrchestratorSettings, shutdown: CancellationToken) -> Result<()> {
    info!("orchestrator_starting");

    let store = Arc::new(ConversationStore::open(&settings.database_path)?);
    metrics().set_component_health("database", true);

    let rules = Arc::new(RulesEngine::load(&settings.rules_config_path)?);
    let prompts = Arc::new(PromptBuilder::new());

    let bus = StreamBus::connect(&settings.base.redis_url).await?;
    metrics().set_component_health("redis", true);

    info!("orchestrator_started");

    let transcripts = transcripts_loop(
        bus.clone(),
        Arc::clone(&store),
        Arc::clone(&prompts),
        shutdown.clone(),
    );
    let responses = responses_loop(bus.clone(), Arc::clone(&store), shutdown.clone());
    let proactive = proactive_loop(bus, store, rules, prompts, settings, shutdown);

    tokio::try_join!(transcripts, responses, proactive)?;
    Ok(())
}

async fn transcripts_loop(
    bus: StreamBus,
    store: Arc<ConversationStore>,
    prompts: Arc<PromptBuilder>,
    shutdown: CancellationToken,
) -> Result<()> {
    let publisher = bus.clone();
    bus.consume(
        streams::TEXT_TRANSCRIPTS,
        groups::ORCHESTRATOR,
        "orchestrator-main",
        shutdown,
        move |_message_id, value| {
            let bus = publisher.clone();
            let store = Arc::clone(&store);
            let prompts = Arc::clone(&prompts);
            async move {
                let transcript: Transcript = match decode_message(value) {
                    Ok(transcript) => transcript,
                    Err(e) => {
                        warn!(error = %e, "malformed_transcript");
                        return Ok(());
                    }
                };
                handle_transcript(&bus, &store, &prompts, transcript).await
            }
        },
    )
    .await
}

async fn handle_transcript(
    bus: &StreamBus,
    store: &ConversationStore,
    prompts: &PromptBuilder,
    transcript: Transcript,
) -> Result<()> {
    if transcript.text.trim().is_empty() {
        return Ok(());
    }

    info!(
        session_id = %transcript.session_id,
        text = %transcript.text.chars().take(50).collect::<String>(),
        "processing_transcript"
    );

    let profile = store.get_or_create_profile(&transcript.device_id)?;
    let history = store.conversation_history(&transcript.session_id, HISTORY_WINDOW)?;
    let care_plan = store.care_plan(&profile.user_id)?;
    let system_prompt = prompts.build_system_prompt(&profile, Some(&care_plan));

    // The user turn is persisted after reading history, so the history in
    // the request never includes the message being answered.
    store.add_turn(
        &transcript.session_id,
        Some(&profile.user_id),
        Role::User,
        &transcript.text,
    )?;
    store.record_device_activity(&transcript.device_id, Some(&profile.user_id))?;

    let request = LlmRequest {
        request_id: Uuid::new_v4().to_string(),
        device_id: transcript.device_id,
        session_id: transcript.session_id,
        user_id: profile.user_id.clone(),
        user_message: transcript.text,
        conversation_history: history,
        user_profile: profile,
        care_plan: Some(care_plan),
        system_prompt,
        max_tokens: REACTIVE_MAX_TOKENS,
        temperature: REACTIVE_TEMPERATURE,
    };

    bus.publish(streams::LLM_REQUESTS, &request).await?;
    debug!(request_id = %request.request_id, "llm_request_sent");
    Ok(())
}

async fn responses_loop(
    bus: StreamBus,
    store: Arc<ConversationStore>,
    shutdown: CancellationToken,
) -> Result<()> {
    bus.consume(
        streams::LLM_RESPONSES,
        groups::ORCHESTRATOR,
        "orchestrator-resp",
        shutdown,
        move |_message_id, value| {
            let store = Arc::clone(&store);
            async move {
                let response: LlmResponse = match decode_message(value) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "malformed_llm_response");
                        return Ok(());
                    }
                };

                info!(
                    request_id = %response.request_id,
                    is_fallback = response.is_fallback,
                    text = %response.text.chars().take(50).collect::<String>(),
                    "llm_response_received"
                );

                // At-least-once delivery may replay this write; a repeated
                // assistant turn is observable but harmless.
                store.add_turn(&response.session_id, None, Role::Assistant, &response.text)?;
                Ok(())
            }
        },
    )
    .await
}

async fn proactive_loop(
    bus: StreamBus,
    store: Arc<ConversationStore>,
    rules: Arc<RulesEngine>,
    prompts: Arc<PromptBuilder>,
    settings: &OrchestratorSettings,
    shutdown: CancellationToken,
) -> Result<()> {
    if !settings.base.enable_proactive_rules {
        info!("proactive_rules_disabled");
        return Ok(());
    }

    info!("proactive_rules_engine_started");

    let mut interval = tokio::time::interval(PROACTIVE_TICK);
    // The first tick completes immediately; consume it so evaluation
    // starts one full period after boot.
    interval.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let triggered = rules.evaluate(Local::now().time());
        for rule in triggered {
            if let Err(e) = execute_proactive_rule(&bus, &store, &prompts, rule).await {
                error!(rule = %rule.name, error = %e, "proactive_rule_error");
            }
        }
    }

    Ok(())
}

async fn execute_proactive_rule(
    bus: &StreamBus,
    store: &ConversationStore,
    prompts: &PromptBuilder,
    rule: &Rule,
) -> Result<()> {
    info!(rule = %rule.name, "executing_proactive_rule");

    let profile = store.get_or_create_profile(DEFAULT_DEVICE_ID)?;
    let session_id = format!(
        "{DEFAULT_DEVICE_ID}-proactive-{}",
        Utc::now().timestamp_millis()
    );

    let request = LlmRequest {
        request_id: Uuid::new_v4().to_string(),
        device_id: DEFAULT_DEVICE_ID.to_owned(),
        session_id,
        user_id: profile.user_id.clone(),
        user_message: format!("[PROACTIVE:{}] {}", rule.name, rule.prompt),
        conversation_history: Vec::new(),
        system_prompt: prompts.build_proactive_prompt(&profile, rule),
        user_profile: profile,
        care_plan: None,
        max_tokens: PROACTIVE_MAX_TOKENS,
        temperature: PROACTIVE_TEMPERATURE,
    };

    bus.publish(streams::LLM_REQUESTS, &request).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proactive_user_message_carries_rule_tag() {
        let rule = &rules::default_rules()[0];
        let message = format!("[PROACTIVE:{}] {}", rule.name, rule.prompt);
        assert!(message.starts_with("[PROACTIVE:morning_greeting]"));
        assert!(message.contains("Good morning"));
    }
}
