//! Proactive interaction rules.
//!
//! Rules load from a YAML file; when the file is missing a built-in set of
//! defaults keeps the companion proactive out of the box. Time-based rules
//! fire inside a local-time window. Behavioral and care-plan triggers parse
//! fully but do not fire yet; their evaluators always decline.

use chrono::NaiveTime;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::error::{PipelineError, Result};

/// How a rule is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    TimeBased,
    Behavioral,
    CarePlan,
}

/// Local-time window, inclusive on both ends, formatted `HH:MM`.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

/// Trigger condition; the relevant fields depend on the rule type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Trigger {
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub silence_duration_minutes: Option<u64>,
    #[serde(default)]
    pub event: Option<String>,
}

/// One proactive rule. Lower priority number means higher priority.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_priority() -> i32 {
    10
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// Evaluates proactive rules against the clock.
#[derive(Debug)]
pub struct RulesEngine {
    rules: Vec<Rule>,
}

impl RulesEngine {
    /// Load rules from the YAML file, or fall back to the built-in set when
    /// the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be parsed.
    pub fn load(config_path: &str) -> Result<Self> {
        let rules = match std::fs::read_to_string(config_path) {
            Ok(text) => {
                let parsed: RulesFile = serde_yaml::from_str(&text)
                    .map_err(|e| PipelineError::Config(format!("rules yaml: {e}")))?;
                info!(count = parsed.rules.len(), path = config_path, "rules_loaded");
                parsed.rules
            }
            Err(_) => {
                warn!(path = config_path, "rules_config_not_found");
                let rules = default_rules();
                info!(count = rules.len(), "using_default_rules");
                rules
            }
        };

        Ok(Self { rules })
    }

    /// Engine over an explicit rule list, for tests.
    pub fn with_rules(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Rules that should fire now, sorted by ascending priority.
    pub fn evaluate(&self, now: NaiveTime) -> Vec<&Rule> {
        let mut triggered: Vec<&Rule> = self
            .rules
            .iter()
            .filter(|rule| match should_trigger(rule, now) {
                Ok(fire) => fire,
                Err(e) => {
                    error!(rule = %rule.name, error = %e, "rule_evaluation_error");
                    false
                }
            })
            .collect();

        triggered.sort_by_key(|rule| rule.priority);
        triggered
    }
}

fn should_trigger(rule: &Rule, now: NaiveTime) -> Result<bool> {
    match rule.rule_type {
        RuleType::TimeBased => match &rule.trigger.time_range {
            Some(range) => time_in_range(range, now),
            None => Ok(false),
        },
        // Silence tracking and care-plan schedules are parsed but their
        // evaluators are not wired yet; they never fire.
        RuleType::Behavioral | RuleType::CarePlan => Ok(false),
    }
}

fn time_in_range(range: &TimeRange, now: NaiveTime) -> Result<bool> {
    let start = parse_clock(&range.start)?;
    let end = parse_clock(&range.end)?;
    Ok(start <= now && now <= end)
}

fn parse_clock(text: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(text, "%H:%M")
        .map_err(|e| PipelineError::Config(format!("bad time '{text}': {e}")))
}

/// Built-in rules used when no config file is present.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "morning_greeting".to_owned(),
            rule_type: RuleType::TimeBased,
            trigger: Trigger {
                time_range: Some(TimeRange {
                    start: "07:00".to_owned(),
                    end: "09:00".to_owned(),
                }),
                ..Trigger::default()
            },
            frequency: Some("daily".to_owned()),
            prompt: "Good morning! How are you feeling today?".to_owned(),
            priority: 1,
        },
        Rule {
            name: "afternoon_checkin".to_owned(),
            rule_type: RuleType::TimeBased,
            trigger: Trigger {
                time_range: Some(TimeRange {
                    start: "14:00".to_owned(),
                    end: "15:00".to_owned(),
                }),
                ..Trigger::default()
            },
            frequency: Some("daily".to_owned()),
            prompt: "How is your afternoon going? Have you had lunch?".to_owned(),
            priority: 2,
        },
        Rule {
            name: "evening_winddown".to_owned(),
            rule_type: RuleType::TimeBased,
            trigger: Trigger {
                time_range: Some(TimeRange {
                    start: "19:00".to_owned(),
                    end: "20:00".to_owned(),
                }),
                ..Trigger::default()
            },
            frequency: Some("daily".to_owned()),
            prompt: "The evening is here. How was your day?".to_owned(),
            priority: 2,
        },
        Rule {
            name: "extended_silence".to_owned(),
            rule_type: RuleType::Behavioral,
            trigger: Trigger {
                silence_duration_minutes: Some(120),
                ..Trigger::default()
            },
            frequency: None,
            prompt: "I haven't heard from you in a while. Is everything okay?".to_owned(),
            priority: 3,
        },
        Rule {
            name: "medication_reminder".to_owned(),
            rule_type: RuleType::CarePlan,
            trigger: Trigger {
                event: Some("medication_due".to_owned()),
                ..Trigger::default()
            },
            frequency: None,
            prompt: "It's time for your medication. Would you like me to remind you what to take?"
                .to_owned(),
            priority: 1,
        },
    ]
}
