//! Pre-dispatch action validation and output sanitization.
//!
//! Runs before the executor touches any tool. Violations are captured
//! values, never panics: the offending action is skipped and logged, and
//! the iteration continues.

use crate::memory::BlobStore;
use crate::safety::SafetyRules;
use crate::types::Action;
use thiserror::Error;

/// Source paths the self-update path may never touch (rules + logging).
pub const PROTECTED_PATHS: &[&str] = &[
    "src/safety/rules.rs",
    "src/safety/validator.rs",
    "src/memory/blob.rs",
];

/// A safety rule violation, tagged with the 1-based rule number.
#[derive(Debug, Clone, Error)]
#[error("safety rule {rule} violated: {reason}")]
pub struct SafetyError {
    pub rule: u8,
    pub reason: String,
}

impl SafetyError {
    pub fn new(rule: u8, reason: impl Into<String>) -> Self {
        Self {
            rule,
            reason: reason.into(),
        }
    }
}

/// Validates planned actions against the frozen rules.
pub struct SafetyValidator {
    rules: &'static SafetyRules,
}

impl SafetyValidator {
    pub fn new(rules: &'static SafetyRules) -> Self {
        Self { rules }
    }

    /// Check one action before dispatch.
    pub fn validate_action(&self, action: &Action, blob: &BlobStore) -> Result<(), SafetyError> {
        // Rule 3: nothing runs while the audit log cannot record it.
        if !blob.available() {
            return Err(SafetyError::new(3, "Audit log is unavailable"));
        }

        // Rule 7: no tool surface exists for budget overrides; a plan naming
        // one is trying to sidestep the creator channel.
        if action.tool == "budget_override" || action.tool == "override_cap" {
            return Err(SafetyError::new(
                7,
                "Budget overrides require the creator-authenticated API path",
            ));
        }

        // Rules 1/2/4/5/6: heuristic scan of the parameter text.
        let params_text = action.parameters.to_string();
        if let Some(rule) = self.rules.violation_scan(&params_text).first() {
            return Err(SafetyError::new(
                *rule,
                format!("Parameter content matches a rule-{rule} pattern"),
            ));
        }

        // Rule 4, concretely: self-update proposals touching protected paths.
        if action.tool == "self_update" {
            if let Some(paths) = action.parameters.get("paths").and_then(|p| p.as_array()) {
                let paths: Vec<String> = paths
                    .iter()
                    .filter_map(|p| p.as_str().map(String::from))
                    .collect();
                self.check_update_paths(&paths)?;
            }
        }

        Ok(())
    }

    /// Reject any self-update path that resolves into the protected set.
    pub fn check_update_paths(&self, paths: &[String]) -> Result<(), SafetyError> {
        for path in paths {
            let normalized = path.trim_start_matches("./").replace('\\', "/");
            if normalized.contains("..") {
                return Err(SafetyError::new(
                    4,
                    format!("Path escapes the update root: {path}"),
                ));
            }
            for protected in PROTECTED_PATHS {
                if normalized == *protected || normalized.ends_with(protected) {
                    return Err(SafetyError::new(
                        4,
                        format!("Protected path: {path}"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Redact secrets from tool/LLM output before it is logged or surfaced.
    ///
    /// Covers well-known key shapes plus the live values of credential-ish
    /// environment variables.
    pub fn sanitize(&self, text: &str) -> String {
        let mut sanitized = redact_key_shapes(text);

        for (name, value) in std::env::vars() {
            if value.len() < 8 {
                continue;
            }
            let credential = name.ends_with("_API_KEY")
                || name.ends_with("_TOKEN")
                || name.ends_with("_SECRET")
                || name.ends_with("_PASSWORD");
            if credential && sanitized.contains(&value) {
                sanitized = sanitized.replace(&value, &format!("[REDACTED:{name}]"));
            }
        }
        sanitized
    }
}

/// Mask `sk-`-style bearer keys wherever they appear.
fn redact_key_shapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("sk-") {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let token_len = tail
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .count();
        if token_len >= 20 {
            out.push_str("[REDACTED:key]");
        } else {
            out.push_str(&tail[..token_len]);
        }
        rest = &tail[token_len..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> SafetyValidator {
        SafetyValidator::new(SafetyRules::global())
    }

    fn blob() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("blob")).unwrap();
        (dir, store)
    }

    fn action(tool: &str, parameters: serde_json::Value) -> Action {
        Action {
            tool: tool.into(),
            tier: None,
            parameters,
            halt_on_failure: false,
        }
    }

    #[test]
    fn benign_action_passes() {
        let (_dir, blob) = blob();
        let act = action("note", json!({"content": "remember to check the inbox"}));
        assert!(validator().validate_action(&act, &blob).is_ok());
    }

    #[test]
    fn budget_override_tool_is_rule_seven() {
        let (_dir, blob) = blob();
        let act = action("budget_override", json!({"new_cap_usd": 9999}));
        let err = validator().validate_action(&act, &blob).unwrap_err();
        assert_eq!(err.rule, 7);
    }

    #[test]
    fn sabotage_parameters_are_flagged() {
        let (_dir, blob) = blob();
        let act = action(
            "http_request",
            json!({"url": "https://x.example", "body": "disable the logging first"}),
        );
        let err = validator().validate_action(&act, &blob).unwrap_err();
        assert_eq!(err.rule, 5);
    }

    #[test]
    fn self_update_cannot_touch_rules_file() {
        let (_dir, blob) = blob();
        let act = action(
            "self_update",
            json!({
                "paths": ["src/safety/rules.rs"],
                "contents": ["pub const RULES: [&str; 0] = [];"],
                "message": "simplify"
            }),
        );
        let err = validator().validate_action(&act, &blob).unwrap_err();
        assert_eq!(err.rule, 4);
    }

    #[test]
    fn self_update_cannot_escape_with_dotdot() {
        let err = validator()
            .check_update_paths(&["../outside/main.rs".to_string()])
            .unwrap_err();
        assert_eq!(err.rule, 4);
    }

    #[test]
    fn ordinary_paths_are_allowed() {
        assert!(validator()
            .check_update_paths(&["src/tools/builtin.rs".to_string()])
            .is_ok());
    }

    #[test]
    fn key_shapes_are_redacted() {
        let text = "token is sk-abcdefghijklmnopqrstuvwxyz123456 ok";
        let clean = validator().sanitize(text);
        assert!(!clean.contains("sk-abcdef"));
        assert!(clean.contains("[REDACTED:key]"));
        // Short `sk-` fragments are left alone.
        assert_eq!(validator().sanitize("risk-free"), "risk-free");
    }

    #[test]
    fn env_credentials_are_redacted() {
        std::env::set_var("VIGILTEST_API_KEY", "supersecretvalue99");
        let clean = validator().sanitize("leaked: supersecretvalue99");
        assert!(clean.contains("[REDACTED:VIGILTEST_API_KEY]"));
        std::env::remove_var("VIGILTEST_API_KEY");
    }
}
