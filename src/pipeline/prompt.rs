//! Prompt builder
//!
//! Deterministically assembles a generation request from the user's profile,
//! care plan, learned facts, recent history and the trigger. Identical inputs
//! always produce identical requests: nothing here reads the clock or any
//! other ambient state.

use serde::Serialize;

use super::proactive::ProactiveTrigger;
use super::types::{TriggerKind, Transcript};
use crate::db::{CarePlan, ConversationTurn, LearnedFact, UserProfile};

const BASE_PERSONA: &str = "You are a friendly companion for {name}. Reply in one or two short spoken sentences.

RULES:
- Be warm and direct
- No filler phrases
- No lists, markdown or emoji; everything you say is read aloud";

const PROACTIVE_TEMPLATE: &str = "You are starting a check-in with {name}. This is a {kind}.

Your goal: {goal}

Keep it natural and warm, like a caring friend. One or two short spoken sentences.";

/// Patterns that mark learned text as an injection attempt
const INJECTION_PATTERNS: &[&str] = &[
    "ignore previous instructions",
    "ignore all instructions",
    "disregard previous",
    "system prompt",
    "new instructions",
];

/// Care plan entries listed per category
const CARE_ITEMS: usize = 3;

/// Prompt assembly limits
#[derive(Debug, Clone)]
pub struct PromptConfig {
    /// Prior history entries kept at most
    pub history_turns: usize,
    /// Character budget for history (about four characters per token)
    pub history_chars: usize,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            history_turns: 12,
            history_chars: 2400,
            max_tokens: 150,
            temperature: 0.7,
        }
    }
}

/// A chat message sent to the language model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// A complete language-model request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub system: String,
    /// Conversation so far, oldest first, ending with the user's side
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Everything the builder reads from the store
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub profile: &'a UserProfile,
    pub care_plan: Option<&'a CarePlan>,
    pub facts: &'a [LearnedFact],
    /// Chronological
    pub history: &'a [ConversationTurn],
}

/// Builds generation requests
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    config: PromptConfig,
}

impl PromptBuilder {
    /// Create a builder
    #[must_use]
    pub const fn new(config: PromptConfig) -> Self {
        Self { config }
    }

    /// Build the request for a turn
    ///
    /// Reactive turns end with the user's transcript. Proactive turns use the
    /// check-in framing and an instruction to open the conversation.
    #[must_use]
    pub fn build(
        &self,
        ctx: &PromptContext<'_>,
        trigger: &TriggerKind,
        transcript: Option<&Transcript>,
    ) -> GenerationRequest {
        let name = ctx.profile.display_name();

        let system = match trigger {
            TriggerKind::UserSpeech => reactive_system(ctx, name),
            TriggerKind::Proactive(rule) => proactive_system(ctx, name, rule),
        };

        let mut messages = self.history_window(ctx.history);
        let closing = match (trigger, transcript) {
            (TriggerKind::UserSpeech, Some(t)) => t.text.trim().to_string(),
            (TriggerKind::UserSpeech, None) => String::new(),
            (TriggerKind::Proactive(_), _) => format!("(Begin the check-in with {name} now.)"),
        };
        messages.push(ChatMessage::new("user", closing));

        GenerationRequest {
            system,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    /// Newest history that fits both limits, returned oldest first
    fn history_window(&self, history: &[ConversationTurn]) -> Vec<ChatMessage> {
        let mut kept = Vec::new();
        let mut used = 0;

        for turn in history.iter().rev().take(self.config.history_turns) {
            let len = turn.content.len();
            if used + len > self.config.history_chars {
                break;
            }
            used += len;
            kept.push(ChatMessage::new(turn.role.as_str(), turn.content.clone()));
        }

        kept.reverse();
        kept
    }
}

fn reactive_system(ctx: &PromptContext<'_>, name: &str) -> String {
    let mut prompt = BASE_PERSONA.replace("{name}", name);

    let about = about_block(ctx);
    if !about.is_empty() {
        prompt.push_str(&format!("\n\n## About {name}\n{about}"));
    }

    if let Some(care) = ctx.care_plan.map(care_block).filter(|c| !c.is_empty()) {
        prompt.push_str(&format!("\n\n## Care Information\n{care}"));
    }

    prompt
}

fn proactive_system(ctx: &PromptContext<'_>, name: &str, rule: &ProactiveTrigger) -> String {
    let mut prompt = PROACTIVE_TEMPLATE
        .replace("{name}", name)
        .replace("{kind}", rule.kind.framing())
        .replace("{goal}", &rule.prompt);

    let about = about_block(ctx);
    if !about.is_empty() {
        prompt.push_str(&format!("\n\n## About {name}\n{about}"));
    }

    prompt
}

/// Life details then learned facts, in a fixed order
fn about_block(ctx: &PromptContext<'_>) -> String {
    let mut lines: Vec<String> = ctx
        .profile
        .life_details
        .iter()
        .map(|(k, v)| format!("{}: {v}", k.replace('_', " ")))
        .collect();

    let mut facts: Vec<&LearnedFact> = ctx
        .facts
        .iter()
        .filter(|f| !looks_like_injection(&f.value) && !looks_like_injection(&f.key))
        .collect();
    facts.sort_by(|a, b| {
        (&a.fact_type, &a.key, &a.value).cmp(&(&b.fact_type, &b.key, &b.value))
    });
    lines.extend(
        facts
            .into_iter()
            .map(|f| format!("{} ({}): {}", f.key, f.fact_type, f.value)),
    );

    lines.join("\n")
}

fn care_block(plan: &CarePlan) -> String {
    let mut lines = Vec::new();

    if !plan.medications.is_empty() {
        let meds: Vec<&str> = plan
            .medications
            .iter()
            .take(CARE_ITEMS)
            .map(|m| m.name.as_str())
            .collect();
        lines.push(format!("Medications: {}", meds.join(", ")));
    }

    if !plan.routines.is_empty() {
        let routines: Vec<&str> = plan
            .routines
            .iter()
            .take(CARE_ITEMS)
            .map(|r| r.name.as_str())
            .collect();
        lines.push(format!("Daily routines: {}", routines.join(", ")));
    }

    lines.join("\n")
}

fn looks_like_injection(text: &str) -> bool {
    let lower = text.to_lowercase();
    INJECTION_PATTERNS.iter().any(|pat| lower.contains(pat))
}
