//! Field-level input validation shared by the enqueue boundary and the
//! worker's unsigned (trust-reduced) admission path.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static DANGEROUS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)<script",
        r"(?i)javascript:",
        r"(?i)on\w+\s*=",
        r"\.\./",
        r"(?i)%2e%2e",
        r"(?i);\s*exec",
        r"(?i);\s*drop",
        r"--",
        r"(?i)'\s*or\s+'",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

static ACCOUNT_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").expect("static pattern"));

pub fn contains_dangerous_content(value: &str) -> bool {
    DANGEROUS_PATTERNS.iter().any(|p| p.is_match(value))
}

pub fn validate_account_id(account_id: &str) -> bool {
    !contains_dangerous_content(account_id) && ACCOUNT_ID_PATTERN.is_match(account_id)
}

/// Scan every string leaf of a payload for dangerous patterns.
/// Returns the JSON path of the first offending value.
pub fn scan_task_data(data: &Value) -> Option<String> {
    scan_value(data, "data")
}

fn scan_value(value: &Value, path: &str) -> Option<String> {
    match value {
        Value::String(s) => contains_dangerous_content(s).then(|| path.to_string()),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, item)| scan_value(item, &format!("{}[{}]", path, i))),
        Value::Object(map) => map
            .iter()
            .find_map(|(key, item)| scan_value(item, &format!("{}.{}", path, key))),
        _ => None,
    }
}

/// Truncate, strip null bytes and non-printable control characters.
pub fn sanitize_string(value: &str, max_length: usize) -> String {
    value
        .chars()
        .take(max_length)
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn account_id_pattern() {
        assert!(validate_account_id("acct_1"));
        assert!(validate_account_id("ABC-123_xyz"));
        assert!(!validate_account_id(""));
        assert!(!validate_account_id("has space"));
        assert!(!validate_account_id("way/too/dangerous"));
        assert!(!validate_account_id(&"a".repeat(65)));
    }

    #[test]
    fn dangerous_patterns_detected() {
        for bad in [
            "<script>alert(1)</script>",
            "javascript:void(0)",
            "onload=pwn()",
            "../../etc/passwd",
            "%2e%2e%2fsecret",
            "; exec xp_cmdshell",
            "1; DROP TABLE tasks",
            "comment -- injection",
            "' or '1'='1",
        ] {
            assert!(contains_dangerous_content(bad), "should flag: {bad}");
        }
        assert!(!contains_dangerous_content("2019 Volvo XC90, clean title"));
    }

    #[test]
    fn scan_reports_nested_path() {
        let data = json!({
            "vehicle": {"description": "good car"},
            "photos": ["a.jpg", "<script>x</script>"]
        });
        let path = scan_task_data(&data).expect("should flag the photo entry");
        assert_eq!(path, "data.photos[1]");

        let clean = json!({"vehicle": {"price": 100}, "photos": []});
        assert!(scan_task_data(&clean).is_none());
    }

    #[test]
    fn sanitize_strips_controls_and_truncates() {
        let input = "  hello\x00world\x07 \n";
        assert_eq!(sanitize_string(input, 100), "helloworld");
        assert_eq!(sanitize_string("abcdef", 3), "abc");
        // newlines and tabs survive
        assert_eq!(sanitize_string("a\tb\nc", 100), "a\tb\nc");
    }
}
