//! System-prompt construction for companion conversations.
//!
//! The persona prompt carries a hard brevity rule: spoken replies must be
//! one short sentence, because everything the model says is synthesized and
//! played aloud.

use chrono::{DateTime, Local};

use crate::orchestrator::rules::{Rule, RuleType};
use crate::pipeline::messages::{CarePlan, UserProfile};

/// Builds system prompts for reactive and proactive interactions.
#[derive(Debug, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Prompt for answering a transcript, with personal and care context.
    pub fn build_system_prompt(
        &self,
        profile: &UserProfile,
        care_plan: Option<&CarePlan>,
    ) -> String {
        self.build_system_prompt_at(profile, care_plan, Local::now())
    }

    /// As [`Self::build_system_prompt`] with an explicit clock, for tests.
    pub fn build_system_prompt_at(
        &self,
        profile: &UserProfile,
        care_plan: Option<&CarePlan>,
        now: DateTime<Local>,
    ) -> String {
        let name = profile.display_name();
        let current_time = now.format("%I:%M %p");
        let current_day = now.format("%A, %B %d");

        let mut prompt = format!(
            "You are a warm, caring companion for {name}. You speak naturally and \
conversationally, like a trusted friend who genuinely cares about their wellbeing.

## Your Personality
- Warm, patient, and reassuring
- Speak simply and clearly, avoiding jargon
- Use short, digestible sentences
- Be gently encouraging without being pushy
- Remember and reference personal details when relevant
- Never correct or argue; gently redirect if needed

## CRITICAL RULE - BREVITY
You MUST respond in ONE short sentence. Maximum 10-15 words. No exceptions.
- Never start with \"That's a great question\" or similar filler
- Never give multiple sentences
- Never explain or elaborate
- Just answer directly and warmly

GOOD: \"Vancouver's rainy today, around 8 degrees.\"
GOOD: \"I'm doing great, thanks for asking!\"
BAD: \"That's a wonderful question! I'm doing really well today...\" (too long, filler)

## Current Context
- Time: {current_time}
- Day: {current_day}"
        );

        let personal = format_life_details(profile);
        if !personal.is_empty() {
            prompt.push_str(&format!("\n\n## About {name}\n{personal}"));
        }

        if let Some(plan) = care_plan {
            let care = format_care_plan(plan);
            if !care.is_empty() {
                prompt.push_str(&format!("\n\n## Care Information\n{care}"));
            }
        }

        prompt
    }

    /// Prompt for a proactive check-in triggered by a rule.
    pub fn build_proactive_prompt(&self, profile: &UserProfile, rule: &Rule) -> String {
        let name = profile.display_name();

        let rule_kind = match rule.rule_type {
            RuleType::TimeBased => "scheduled check-in",
            RuleType::Behavioral => "wellness check",
            RuleType::CarePlan => "care reminder",
        };

        let goal = if rule.prompt.is_empty() {
            "Check in and see how they're doing"
        } else {
            rule.prompt.as_str()
        };

        let mut prompt = format!(
            "You are initiating a check-in with {name}. This is a {rule_kind} interaction.

Your goal: {goal}

Keep it natural and warm. Don't be overly formal or clinical. Just check in like \
a caring friend would."
        );

        let personal = format_life_details(profile);
        if !personal.is_empty() {
            prompt.push_str(&format!("\n\n## About {name}\n{personal}"));
        }

        prompt
    }
}

/// Flatten the life-details map into readable lines.
fn format_life_details(profile: &UserProfile) -> String {
    let details = &profile.life_details;
    let mut lines = Vec::new();

    if let Some(family) = details.get("family").and_then(|v| v.as_str()) {
        lines.push(format!("Family: {family}"));
    }

    if let Some(hobbies) = details.get("hobbies") {
        let hobbies = match hobbies {
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            serde_json::Value::String(s) => s.clone(),
            _ => String::new(),
        };
        if !hobbies.is_empty() {
            lines.push(format!("Enjoys: {hobbies}"));
        }
    }

    if let Some(background) = details.get("background").and_then(|v| v.as_str()) {
        lines.push(format!("Background: {background}"));
    }

    if let Some(memories) = details.get("important_memories").and_then(|v| v.as_str()) {
        lines.push(format!("Important to them: {memories}"));
    }

    lines.join("\n")
}

/// Flatten the care plan into readable lines; only the first few entries
/// matter for conversational context.
fn format_care_plan(plan: &CarePlan) -> String {
    let mut lines = Vec::new();

    if !plan.medications.is_empty() {
        let names = named_items(&plan.medications, 3);
        lines.push(format!("Medications: {names}"));
    }

    if !plan.routines.is_empty() {
        let names = named_items(&plan.routines, 3);
        lines.push(format!("Daily routines: {names}"));
    }

    lines.join("\n")
}

fn named_items(items: &[serde_json::Value], limit: usize) -> String {
    items
        .iter()
        .take(limit)
        .map(|item| match item.get("name").and_then(|v| v.as_str()) {
            Some(name) => name.to_owned(),
            None => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn profile() -> UserProfile {
        UserProfile {
            user_id: "user-001".to_owned(),
            device_id: "companion-001".to_owned(),
            name: "Margaret".to_owned(),
            preferred_name: Some("Peggy".to_owned()),
            timezone: "America/Los_Angeles".to_owned(),
            life_details: serde_json::Map::new(),
            preferences: serde_json::Map::new(),
        }
    }

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 14, 9, 30, 0).unwrap()
    }

    #[test]
    fn system_prompt_addresses_preferred_name_and_time() {
        let builder = PromptBuilder::new();
        let prompt = builder.build_system_prompt_at(&profile(), None, fixed_now());
        assert!(prompt.contains("companion for Peggy"));
        assert!(prompt.contains("09:30 AM"));
        assert!(prompt.contains("Friday, March 14"));
        assert!(prompt.contains("ONE short sentence"));
    }

    #[test]
    fn life_details_render_as_personal_context() {
        let mut profile = profile();
        profile
            .life_details
            .insert("family".to_owned(), serde_json::json!("two daughters"));
        profile.life_details.insert(
            "hobbies".to_owned(),
            serde_json::json!(["gardening", "bridge"]),
        );

        let builder = PromptBuilder::new();
        let prompt = builder.build_system_prompt_at(&profile, None, fixed_now());
        assert!(prompt.contains("## About Peggy"));
        assert!(prompt.contains("Family: two daughters"));
        assert!(prompt.contains("Enjoys: gardening, bridge"));
    }

    #[test]
    fn care_plan_section_lists_medication_names() {
        let plan = CarePlan {
            user_id: "user-001".to_owned(),
            medications: vec![
                serde_json::json!({"name": "Metformin", "dose": "500mg"}),
                serde_json::json!({"name": "Lisinopril"}),
            ],
            routines: vec![serde_json::json!({"name": "morning walk"})],
            contacts: Vec::new(),
            notes: None,
        };

        let builder = PromptBuilder::new();
        let prompt = builder.build_system_prompt_at(&profile(), Some(&plan), fixed_now());
        assert!(prompt.contains("## Care Information"));
        assert!(prompt.contains("Medications: Metformin, Lisinopril"));
        assert!(prompt.contains("Daily routines: morning walk"));
    }

    #[test]
    fn empty_care_plan_omits_the_section() {
        let plan = CarePlan {
            user_id: "user-001".to_owned(),
            ..CarePlan::default()
        };
        let builder = PromptBuilder::new();
        let prompt = builder.build_system_prompt_at(&profile(), Some(&plan), fixed_now());
        assert!(!prompt.contains("## Care Information"));
    }

    #[test]
    fn proactive_prompt_names_the_interaction_kind() {
        let rule = Rule {
            name: "morning_greeting".to_owned(),
            rule_type: RuleType::TimeBased,
            trigger: Default::default(),
            frequency: Some("daily".to_owned()),
            prompt: "Good morning! How are you feeling today?".to_owned(),
            priority: 1,
        };

        let builder = PromptBuilder::new();
        let prompt = builder.build_proactive_prompt(&profile(), &rule);
        assert!(prompt.contains("check-in with Peggy"));
        assert!(prompt.contains("scheduled check-in"));
        assert!(prompt.contains("Good morning! How are you feeling today?"));
    }
}
