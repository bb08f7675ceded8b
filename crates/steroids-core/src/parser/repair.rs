//! Best-effort repair of almost-JSON.
//!
//! Orchestrator replies frequently arrive wrapped in markdown fences,
//! with smart quotes, Python literals, unquoted keys, single-quoted
//! strings, or trailing commas. The normaliser folds each of those back
//! toward strict JSON; the result is re-parsed, never trusted blindly.

use std::sync::OnceLock;

use regex::Regex;

fn unquoted_keys() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).unwrap())
}

fn single_quoted() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Conservative: only strings without quotes or backslashes inside.
    RE.get_or_init(|| Regex::new(r#"'([^'"\\]*)'"#).unwrap())
}

fn trailing_commas() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").unwrap())
}

fn python_literals() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(True|False|None)\b").unwrap())
}

/// Strip a wrapping markdown code fence, tagged or not.
pub fn strip_fences(s: &str) -> String {
    let trimmed = s.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    let without_open = match trimmed.find('\n') {
        Some(pos) => &trimmed[pos + 1..],
        None => return trimmed.to_string(),
    };
    match without_open.rfind("```") {
        Some(pos) => without_open[..pos].trim().to_string(),
        None => without_open.trim().to_string(),
    }
}

/// Fold smart quotes to their ASCII forms.
pub fn fold_smart_quotes(s: &str) -> String {
    s.replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
}

/// Apply the full repair pipeline.
pub fn normalize(s: &str) -> String {
    let mut out = strip_fences(s);
    out = fold_smart_quotes(&out);
    out = python_literals()
        .replace_all(&out, |caps: &regex::Captures<'_>| {
            match caps.get(1).map(|m| m.as_str()) {
                Some("True") => "true",
                Some("False") => "false",
                _ => "null",
            }
            .to_string()
        })
        .into_owned();
    out = unquoted_keys().replace_all(&out, "$1\"$2\":").into_owned();
    out = single_quoted().replace_all(&out, "\"$1\"").into_owned();
    out = trailing_commas().replace_all(&out, "$1").into_owned();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tagged_fence() {
        let s = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_fences(s), "{\"a\": 1}");
    }

    #[test]
    fn strips_untagged_fence() {
        let s = "```\n{\"a\": 1}\n```";
        assert_eq!(strip_fences(s), "{\"a\": 1}");
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(strip_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn folds_smart_quotes() {
        let s = "{\u{201c}action\u{201d}: \u{201c}submit\u{201d}}";
        assert_eq!(fold_smart_quotes(s), "{\"action\": \"submit\"}");
    }

    #[test]
    fn repairs_python_literal_leak() {
        let s = r#"{"exit_clean": True, "has_commits": False, "notes": None}"#;
        let fixed = normalize(s);
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["exit_clean"], true);
        assert_eq!(v["has_commits"], false);
        assert!(v["notes"].is_null());
    }

    #[test]
    fn quotes_unquoted_keys() {
        let s = r#"{action: "submit", reasoning: "ok"}"#;
        let fixed = normalize(s);
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["action"], "submit");
    }

    #[test]
    fn converts_single_quoted_strings() {
        let s = r#"{"action": 'submit'}"#;
        let fixed = normalize(s);
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["action"], "submit");
    }

    #[test]
    fn strips_trailing_commas() {
        let s = r#"{"a": 1, "b": [1, 2,],}"#;
        let fixed = normalize(s);
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["b"][1], 2);
    }

    #[test]
    fn combined_repairs() {
        let s = "```json\n{action: 'submit', \u{201c}reasoning\u{201d}: \u{201c}ok\u{201d}, exit_clean: True,}\n```";
        let fixed = normalize(s);
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["action"], "submit");
        assert_eq!(v["reasoning"], "ok");
        assert_eq!(v["exit_clean"], true);
    }

    #[test]
    fn does_not_mangle_apostrophes_in_double_quoted_text() {
        let s = r#"{"reasoning": "it's fine"}"#;
        let fixed = normalize(s);
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["reasoning"], "it's fine");
    }
}
