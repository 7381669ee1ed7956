//! Proactive scheduler
//!
//! Declarative rules evaluated on a fixed tick. Firing is edge-triggered: a
//! rule fires when its condition goes from false to true and stays quiet
//! while the condition holds.

use std::collections::HashMap;
use std::path::Path;

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const MINUTES_PER_DAY: i64 = 24 * 60;

/// Broad category of a rule, used to frame the prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    TimeBased,
    Behavioral,
    CarePlan,
}

impl RuleKind {
    /// How the companion frames this kind of check-in
    #[must_use]
    pub const fn framing(self) -> &'static str {
        match self {
            Self::TimeBased => "scheduled check-in",
            Self::Behavioral => "wellness check",
            Self::CarePlan => "care reminder",
        }
    }
}

/// What makes a rule fire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Local time within `start..=end` (HH:MM, may wrap past midnight)
    TimeOfDay { start: String, end: String },
    /// No interaction for at least this many minutes
    Silence { minutes: u64 },
    /// A care-plan medication time fell within the last window
    MedicationDue {
        #[serde(default = "default_medication_window")]
        window_minutes: u64,
    },
}

const fn default_medication_window() -> u64 {
    15
}

const fn default_priority() -> u8 {
    5
}

impl Condition {
    /// Rule category implied by the condition
    #[must_use]
    pub const fn kind(&self) -> RuleKind {
        match self {
            Self::TimeOfDay { .. } => RuleKind::TimeBased,
            Self::Silence { .. } => RuleKind::Behavioral,
            Self::MedicationDue { .. } => RuleKind::CarePlan,
        }
    }
}

/// A declarative proactive rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    /// Lower fires first
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Goal of the check-in, handed to the prompt builder
    pub prompt: String,
    pub condition: Condition,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// A fired rule, queued as a proactive turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProactiveTrigger {
    pub rule: String,
    pub prompt: String,
    pub kind: RuleKind,
    pub priority: u8,
}

/// Inputs a rule may look at
#[derive(Debug, Clone)]
pub struct RuleContext<'a> {
    /// Local wall-clock time
    pub now: NaiveDateTime,
    /// Last user or companion activity
    pub last_interaction: NaiveDateTime,
    /// Medication times from the care plan (HH:MM)
    pub medication_times: &'a [String],
}

/// Built-in rules used when no rules file is configured
#[must_use]
pub fn default_rules() -> Vec<Rule> {
    fn window(name: &str, start: &str, end: &str, priority: u8, prompt: &str) -> Rule {
        Rule {
            name: name.to_string(),
            priority,
            prompt: prompt.to_string(),
            condition: Condition::TimeOfDay {
                start: start.to_string(),
                end: end.to_string(),
            },
        }
    }

    vec![
        window(
            "morning_greeting",
            "07:00",
            "09:00",
            1,
            "Good morning! How are you feeling today?",
        ),
        window(
            "afternoon_checkin",
            "14:00",
            "15:00",
            2,
            "How is your afternoon going? Have you had lunch?",
        ),
        window(
            "evening_winddown",
            "19:00",
            "20:00",
            2,
            "The evening is here. How was your day?",
        ),
        Rule {
            name: "extended_silence".to_string(),
            priority: 3,
            prompt: "I haven't heard from you in a while. Is everything okay?".to_string(),
            condition: Condition::Silence { minutes: 120 },
        },
        Rule {
            name: "medication_reminder".to_string(),
            priority: 1,
            prompt: "It's time for your medication. Would you like me to remind you what to take?"
                .to_string(),
            condition: Condition::MedicationDue {
                window_minutes: default_medication_window(),
            },
        },
    ]
}

/// Load rules from a YAML file, or the defaults if there is none
///
/// # Errors
///
/// Returns error if the file exists but cannot be read or parsed
pub fn load_rules(path: Option<&Path>) -> Result<Vec<Rule>> {
    let Some(path) = path else {
        return Ok(default_rules());
    };

    if !path.exists() {
        tracing::warn!(path = %path.display(), "rules file not found, using defaults");
        return Ok(default_rules());
    }

    let content = std::fs::read_to_string(path)?;
    let file: RuleFile = serde_yaml::from_str(&content)?;
    tracing::info!(path = %path.display(), count = file.rules.len(), "rules loaded");
    Ok(file.rules)
}

fn parse_time(rule: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|e| Error::RuleMisfire {
        rule: rule.to_string(),
        reason: format!("invalid time '{value}': {e}"),
    })
}

fn minute_of_day(t: NaiveTime) -> i64 {
    i64::from(t.hour()) * 60 + i64::from(t.minute())
}

impl Rule {
    /// Whether the condition holds right now
    ///
    /// # Errors
    ///
    /// Returns `Error::RuleMisfire` if the rule cannot be evaluated
    pub fn is_active(&self, ctx: &RuleContext<'_>) -> Result<bool> {
        match &self.condition {
            Condition::TimeOfDay { start, end } => {
                let start = parse_time(&self.name, start)?;
                let end = parse_time(&self.name, end)?;
                let now = ctx.now.time();
                Ok(if start <= end {
                    start <= now && now <= end
                } else {
                    now >= start || now <= end
                })
            }
            Condition::Silence { minutes } => {
                let elapsed = ctx.now - ctx.last_interaction;
                Ok(elapsed.num_minutes() >= i64::try_from(*minutes).unwrap_or(i64::MAX))
            }
            Condition::MedicationDue { window_minutes } => {
                let window = i64::try_from(*window_minutes).unwrap_or(MINUTES_PER_DAY);
                let now = minute_of_day(ctx.now.time());
                for time in ctx.medication_times {
                    let due = minute_of_day(parse_time(&self.name, time)?);
                    if (now - due).rem_euclid(MINUTES_PER_DAY) < window {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn trigger(&self) -> ProactiveTrigger {
        ProactiveTrigger {
            rule: self.name.clone(),
            prompt: self.prompt.clone(),
            kind: self.condition.kind(),
            priority: self.priority,
        }
    }
}

/// Edge-triggered rule evaluator for one session
#[derive(Debug)]
pub struct ProactiveScheduler {
    rules: Vec<Rule>,
    last_state: HashMap<String, bool>,
}

impl ProactiveScheduler {
    /// Create a scheduler over a rule set
    #[must_use]
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            last_state: HashMap::new(),
        }
    }

    /// Loaded rules
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Evaluate every rule once; returns newly fired triggers by priority
    ///
    /// A rule that misfires is skipped for this tick and keeps its previous
    /// state, so it can still fire on a later tick.
    pub fn evaluate(&mut self, ctx: &RuleContext<'_>) -> Vec<ProactiveTrigger> {
        let mut fired = Vec::new();

        for rule in &self.rules {
            match rule.is_active(ctx) {
                Ok(active) => {
                    let was_active = self
                        .last_state
                        .insert(rule.name.clone(), active)
                        .unwrap_or(false);
                    if active && !was_active {
                        tracing::debug!(rule = %rule.name, "rule fired");
                        fired.push(rule.trigger());
                    }
                }
                Err(e) => {
                    tracing::warn!(rule = %rule.name, error = %e, "rule skipped this tick");
                }
            }
        }

        fired.sort_by_key(|t| t.priority);
        fired
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn ctx(now: NaiveDateTime) -> RuleContext<'static> {
        RuleContext {
            now,
            last_interaction: now,
            medication_times: &[],
        }
    }

    #[test]
    fn test_time_window_fires_once_per_entry() {
        let mut scheduler = ProactiveScheduler::new(default_rules());

        assert!(scheduler.evaluate(&ctx(at(6, 59))).is_empty());
        let fired = scheduler.evaluate(&ctx(at(7, 0)));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule, "morning_greeting");
        assert_eq!(fired[0].kind, RuleKind::TimeBased);

        assert!(scheduler.evaluate(&ctx(at(7, 30))).is_empty());
        assert!(scheduler.evaluate(&ctx(at(9, 1))).is_empty());
    }

    #[test]
    fn test_window_wraps_midnight() {
        let rule = Rule {
            name: "night".to_string(),
            priority: 1,
            prompt: "Sleep well".to_string(),
            condition: Condition::TimeOfDay {
                start: "22:00".to_string(),
                end: "02:00".to_string(),
            },
        };
        assert!(rule.is_active(&ctx(at(23, 0))).unwrap());
        assert!(rule.is_active(&ctx(at(1, 0))).unwrap());
        assert!(!rule.is_active(&ctx(at(12, 0))).unwrap());
    }

    #[test]
    fn test_silence_rule() {
        let mut scheduler = ProactiveScheduler::new(vec![Rule {
            name: "quiet".to_string(),
            priority: 3,
            prompt: "Everything okay?".to_string(),
            condition: Condition::Silence { minutes: 120 },
        }]);

        let mut context = ctx(at(12, 0));
        context.last_interaction = at(10, 30);
        assert!(scheduler.evaluate(&context).is_empty());

        context.now = at(12, 30);
        assert_eq!(scheduler.evaluate(&context).len(), 1);
        context.now = at(13, 0);
        assert!(scheduler.evaluate(&context).is_empty());
    }

    #[test]
    fn test_medication_due_uses_care_plan() {
        let times = vec!["08:00".to_string(), "20:00".to_string()];
        let rule = default_rules()
            .into_iter()
            .find(|r| r.name == "medication_reminder")
            .unwrap();

        let mut context = ctx(at(20, 5));
        context.medication_times = &times;
        assert!(rule.is_active(&context).unwrap());

        context.now = at(20, 30);
        assert!(!rule.is_active(&context).unwrap());
    }

    #[test]
    fn test_misfire_skips_rule_and_keeps_state() {
        let bad = Rule {
            name: "broken".to_string(),
            priority: 1,
            prompt: "x".to_string(),
            condition: Condition::TimeOfDay {
                start: "25:99".to_string(),
                end: "26:00".to_string(),
            },
        };
        assert!(matches!(
            bad.is_active(&ctx(at(8, 0))),
            Err(Error::RuleMisfire { .. })
        ));

        let mut scheduler = ProactiveScheduler::new(vec![bad, default_rules().remove(0)]);
        let fired = scheduler.evaluate(&ctx(at(8, 0)));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule, "morning_greeting");
    }

    #[test]
    fn test_fired_sorted_by_priority() {
        let mut scheduler = ProactiveScheduler::new(default_rules());
        let times = vec!["14:00".to_string()];
        let context = RuleContext {
            now: at(14, 0),
            last_interaction: at(14, 0),
            medication_times: &times,
        };
        let fired: Vec<_> = scheduler
            .evaluate(&context)
            .into_iter()
            .map(|t| t.rule)
            .collect();
        assert_eq!(fired, vec!["medication_reminder", "afternoon_checkin"]);
    }

    #[test]
    fn test_parse_yaml_rules() {
        let yaml = r#"
rules:
  - name: lunch
    priority: 2
    prompt: "Have you eaten?"
    condition:
      type: time_of_day
      start: "12:00"
      end: "13:00"
  - name: pills
    prompt: "Medication time"
    condition:
      type: medication_due
"#;
        let file: RuleFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.rules.len(), 2);
        assert_eq!(file.rules[1].priority, 5);
        assert_eq!(
            file.rules[1].condition,
            Condition::MedicationDue { window_minutes: 15 }
        );
    }

    #[test]
    fn test_missing_rules_file_uses_defaults() {
        let rules = load_rules(Some(Path::new("/nonexistent/rules.yaml"))).unwrap();
        assert_eq!(rules.len(), 5);
    }
}
