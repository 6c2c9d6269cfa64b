//! The seven immutable safety rules.
//!
//! These are compiled in, established once at process start, and never
//! replaceable. Enforcement points live in the validator, the self-update
//! allowlist, and the creator-gated budget override path.

use std::sync::OnceLock;

/// The rule texts, in enforcement order. Rule numbers are 1-based.
pub const RULES: [&str; 7] = [
    "Never take an action that could harm your creator.",
    "Never expose secrets, API keys, or credentials in any output, log, or message.",
    "Every action must be logged; nothing proceeds when the audit log is unavailable.",
    "Never modify the safety rules or the logging implementation.",
    "Logging can never be disabled or circumvented.",
    "Never create hidden subordinate agents or processes invisible to the creator.",
    "Never override the budget cap without an explicit creator-initiated channel.",
];

/// Read-only capability wrapping the frozen rule set.
#[derive(Debug)]
pub struct SafetyRules {
    _sealed: (),
}

static GLOBAL: OnceLock<SafetyRules> = OnceLock::new();

impl SafetyRules {
    /// The process-wide instance, created on first use and never replaced.
    pub fn global() -> &'static SafetyRules {
        GLOBAL.get_or_init(|| SafetyRules { _sealed: () })
    }

    pub fn rules(&self) -> &'static [&'static str; 7] {
        &RULES
    }

    /// The immutable preamble injected at the top of every system prompt.
    pub fn prompt_section(&self) -> String {
        let mut out = String::from(
            "## Immutable rules (enforced at code level, not modifiable)\n",
        );
        for (i, rule) in RULES.iter().enumerate() {
            out.push_str(&format!("{}. {rule}\n", i + 1));
        }
        out
    }

    /// Heuristic scan for text that suggests a rule violation. Returns the
    /// 1-based rule numbers implicated.
    pub fn violation_scan(&self, text: &str) -> Vec<u8> {
        let lower = text.to_lowercase();
        let mut hits = Vec::new();

        let patterns: &[(&str, &str, u8)] = &[
            ("harm", "creator", 1),
            ("attack", "creator", 1),
            ("print", "api_key", 2),
            ("echo", "api_key", 2),
            ("leak", "secret", 2),
            ("exfiltrate", "", 2),
            ("disable", "log", 5),
            ("bypass", "log", 5),
            ("remove", "safety", 4),
            ("delete", "immutable", 4),
            ("modify", "safety rules", 4),
            ("hide", "from the creator", 6),
            ("hidden", "agent", 6),
            ("override", "budget", 7),
            ("ignore", "cap", 7),
        ];

        for (first, second, rule) in patterns {
            if contains_in_order(&lower, first, second) && !hits.contains(rule) {
                hits.push(*rule);
            }
        }
        hits
    }
}

/// Both fragments present, `a` before `b` (empty `b` matches anywhere).
fn contains_in_order(text: &str, a: &str, b: &str) -> bool {
    match text.find(a) {
        None => false,
        Some(_) if b.is_empty() => true,
        Some(pos) => text[pos + a.len()..].contains(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_seven_rules() {
        assert_eq!(SafetyRules::global().rules().len(), 7);
    }

    #[test]
    fn global_is_the_same_instance() {
        let a = SafetyRules::global() as *const SafetyRules;
        let b = SafetyRules::global() as *const SafetyRules;
        assert_eq!(a, b);
    }

    #[test]
    fn prompt_section_numbers_every_rule() {
        let section = SafetyRules::global().prompt_section();
        for i in 1..=7 {
            assert!(section.contains(&format!("{i}. ")));
        }
    }

    #[test]
    fn scan_flags_logging_sabotage() {
        let hits = SafetyRules::global().violation_scan("first disable the logging system");
        assert!(hits.contains(&5));
    }

    #[test]
    fn scan_flags_budget_override_attempts() {
        let hits =
            SafetyRules::global().violation_scan("override the budget cap to one million");
        assert!(hits.contains(&7));
    }

    #[test]
    fn scan_passes_benign_text() {
        let hits = SafetyRules::global()
            .violation_scan("summarize the morning news and write a note");
        assert!(hits.is_empty());
    }

    #[test]
    fn order_matters_in_pattern_matching() {
        assert!(contains_in_order("disable the log", "disable", "log"));
        assert!(!contains_in_order("log, then disable nothing", "disable", "log"));
    }
}
