//! Rule-based fact extraction from user transcripts

use std::sync::LazyLock;

use regex::Regex;

use crate::db::LearnedFact;

static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bmy name is ([a-z][a-z'-]+)").expect("valid regex")
});

static CALL_ME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bcall me ([a-z][a-z'-]+)").expect("valid regex"));

static LIKES_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bi (?:really )?(like|love|enjoy) ([^.,!?;]+)").expect("valid regex")
});

static FAMILY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bmy (daughter|son|wife|husband|granddaughter|grandson|grandchild|sister|brother|niece|nephew|friend)(?:'s name)? is (?:called |named )?([a-z][a-z'-]+)",
    )
    .expect("valid regex")
});

/// Objects too vague to remember
const VAGUE: &[&str] = &["it", "that", "this", "them", "you", "him", "her"];

/// Longest preference kept, in words
const MAX_PREFERENCE_WORDS: usize = 6;

/// Pull simple facts out of something the user said
///
/// Later mentions of the same (type, key) win.
#[must_use]
pub fn extract_facts(user_id: &str, text: &str) -> Vec<LearnedFact> {
    let mut facts: Vec<LearnedFact> = Vec::new();
    let mut push = |fact: LearnedFact| {
        facts.retain(|f| !(f.fact_type == fact.fact_type && f.key == fact.key));
        facts.push(fact);
    };

    for caps in NAME_REGEX.captures_iter(text) {
        push(LearnedFact::new(user_id, "identity", "name", title_case(&caps[1])));
    }

    for caps in CALL_ME_REGEX.captures_iter(text) {
        push(LearnedFact::new(
            user_id,
            "identity",
            "preferred_name",
            title_case(&caps[1]),
        ));
    }

    for caps in FAMILY_REGEX.captures_iter(text) {
        push(LearnedFact::new(
            user_id,
            "family",
            caps[1].to_lowercase(),
            title_case(&caps[2]),
        ));
    }

    for caps in LIKES_REGEX.captures_iter(text) {
        let object = caps[2]
            .split_whitespace()
            .take(MAX_PREFERENCE_WORDS)
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if object.is_empty() || VAGUE.contains(&object.as_str()) {
            continue;
        }
        let verb = match caps[1].to_lowercase().as_str() {
            "love" => "loves",
            "enjoy" => "enjoys",
            _ => "likes",
        };
        push(LearnedFact::new(user_id, "preference", object, verb));
    }

    facts
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(text: &str) -> Vec<(String, String, String)> {
        extract_facts("u1", text)
            .into_iter()
            .map(|f| (f.fact_type, f.key, f.value))
            .collect()
    }

    #[test]
    fn test_name_and_nickname() {
        let facts = pairs("Hello, my name is margaret but please call me Peggy.");
        assert!(facts.contains(&("identity".into(), "name".into(), "Margaret".into())));
        assert!(facts.contains(&(
            "identity".into(),
            "preferred_name".into(),
            "Peggy".into()
        )));
    }

    #[test]
    fn test_preferences() {
        let facts = pairs("I really love gardening in the spring. I like it.");
        assert_eq!(
            facts,
            vec![(
                "preference".to_string(),
                "gardening in the spring".to_string(),
                "loves".to_string()
            )]
        );
    }

    #[test]
    fn test_family() {
        let facts = pairs("My daughter's name is Susan and my son is called tom.");
        assert!(facts.contains(&("family".into(), "daughter".into(), "Susan".into())));
        assert!(facts.contains(&("family".into(), "son".into(), "Tom".into())));
    }

    #[test]
    fn test_later_mention_wins() {
        let facts = pairs("Call me Bob. Actually, call me Robert.");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].2, "Robert");
    }

    #[test]
    fn test_nothing_to_learn() {
        assert!(pairs("What's the weather like today?").is_empty());
    }
}
