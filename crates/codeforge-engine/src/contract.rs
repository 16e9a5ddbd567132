//! Output-contract validation and the repair prompt.

use crate::plan::OutputContract;
use codeforge_core::{CodeforgeError, CodeforgeResult};
use serde_json::Value;

/// Check a raw LLM response and its parsed JSON against the contract.
///
/// Violations are collected, not fatal one-by-one: the caller gets a single
/// `ContractViolation` carrying every finding and asks the model once more
/// with [`build_contract_repair_prompt`].
pub fn validate_output_contract(
    contract: &OutputContract,
    raw_text: &str,
    parsed: &Value,
) -> CodeforgeResult<()> {
    let mut violations: Vec<String> = Vec::new();
    let stripped = raw_text.trim();

    if contract.exact_json_only || contract.no_extra_text_outside_json {
        match first_json_value(stripped) {
            None => violations.push("response is not valid JSON".to_string()),
            Some((value, consumed)) => {
                if !stripped[consumed..].trim().is_empty() {
                    violations.push("response includes extra text outside JSON".to_string());
                }
                if contract.exact_json_only && !value.is_object() {
                    violations.push("top-level JSON must be an object".to_string());
                }
            }
        }
    }

    match parsed.as_object() {
        None => violations.push("parsed response is not a JSON object".to_string()),
        Some(object) => {
            let required = &contract.required_json_top_level_keys;
            if !required.is_empty() {
                if !required.iter().all(|key| object.contains_key(key)) {
                    violations.push("missing required top-level keys".to_string());
                }
                if (contract.exact_json_only || contract.no_extra_text_outside_json)
                    && object.keys().any(|key| !required.contains(key))
                {
                    violations.push("extra top-level keys are not allowed".to_string());
                }
            }

            match object.get("files").and_then(Value::as_array) {
                None => violations.push("files must be a list".to_string()),
                Some(files) => {
                    if let Some(expected) = contract.allowed_files_count {
                        if files.len() != expected {
                            violations.push("files count does not match contract".to_string());
                        }
                    }
                    if let Some(allowed) = &contract.allowed_paths {
                        if !allowed.is_empty() {
                            for entry in files {
                                let path = entry
                                    .get("path")
                                    .or_else(|| entry.get("file"))
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .trim();
                                if !path.is_empty() && !allowed.iter().any(|a| a == path) {
                                    violations.push("file path is not allowed".to_string());
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(CodeforgeError::ContractViolation { violations })
    }
}

/// Parse the first JSON value in `text`, returning it with the number of
/// bytes consumed. Explicit parsing, not a regex: the stream deserializer
/// reports exactly where the first value ends.
fn first_json_value(text: &str) -> Option<(Value, usize)> {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Some((value, stream.byte_offset())),
        _ => None,
    }
}

/// One corrective follow-up asking the model to satisfy the contract.
pub fn build_contract_repair_prompt(contract: &OutputContract, violations: &[String]) -> String {
    let allowed_paths = contract
        .allowed_paths
        .as_deref()
        .unwrap_or_default()
        .join(", ");
    let files_hint = if contract.allowed_files_count == Some(1) {
        "one file"
    } else {
        "files"
    };
    format!(
        "You violated the output contract: {}.\n\
         Return ONLY a valid JSON object with the correct schema. \
         No markdown, no extra text. \
         Include {files_hint} under the 'files' key. \
         Allowed paths: {}.",
        violations.join("; "),
        if allowed_paths.is_empty() {
            "not specified"
        } else {
            allowed_paths.as_str()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strict_contract() -> OutputContract {
        OutputContract {
            exact_json_only: true,
            allowed_files_count: Some(1),
            allowed_paths: Some(vec!["hello.txt".to_string()]),
            no_extra_files: true,
            no_extra_text_outside_json: true,
            ..OutputContract::default()
        }
    }

    #[test]
    fn exact_payload_passes() {
        let raw = r#"{"files":[{"path":"hello.txt","content":"hi"}]}"#;
        let parsed: Value = serde_json::from_str(raw).unwrap();
        assert!(validate_output_contract(&strict_contract(), raw, &parsed).is_ok());
    }

    #[test]
    fn preamble_is_a_violation() {
        let raw = r#"Sure! {"files":[{"path":"hello.txt","content":"hi"}]}"#;
        let parsed = json!({"files":[{"path":"hello.txt","content":"hi"}]});
        let err = validate_output_contract(&strict_contract(), raw, &parsed).unwrap_err();
        match err {
            CodeforgeError::ContractViolation { violations } => {
                assert!(violations
                    .iter()
                    .any(|v| v.contains("not valid JSON") || v.contains("extra text")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn trailing_text_is_a_violation() {
        let raw = r#"{"files":[{"path":"hello.txt","content":"hi"}]} extra"#;
        let parsed = json!({"files":[{"path":"hello.txt","content":"hi"}]});
        let err = validate_output_contract(&strict_contract(), raw, &parsed).unwrap_err();
        match err {
            CodeforgeError::ContractViolation { violations } => {
                assert!(violations.contains(&"response includes extra text outside JSON".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wrong_path_and_count_are_collected_together() {
        let raw = r#"{"files":[{"path":"a.txt","content":"x"},{"path":"b.txt","content":"y"}]}"#;
        let parsed: Value = serde_json::from_str(raw).unwrap();
        let err = validate_output_contract(&strict_contract(), raw, &parsed).unwrap_err();
        match err {
            CodeforgeError::ContractViolation { violations } => {
                assert!(violations.contains(&"files count does not match contract".to_string()));
                assert!(violations.contains(&"file path is not allowed".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn extra_keys_rejected_in_strict_mode() {
        let raw = r#"{"files":[{"path":"hello.txt","content":"hi"}],"note":"x"}"#;
        let parsed: Value = serde_json::from_str(raw).unwrap();
        let err = validate_output_contract(&strict_contract(), raw, &parsed).unwrap_err();
        match err {
            CodeforgeError::ContractViolation { violations } => {
                assert!(violations.contains(&"extra top-level keys are not allowed".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn lenient_contract_allows_prose_and_extras() {
        let contract = OutputContract::default();
        let raw = "Here you go: {\"files\": [], \"artifacts\": {}}";
        let parsed = json!({"files": [], "artifacts": {}});
        assert!(validate_output_contract(&contract, raw, &parsed).is_ok());
    }

    #[test]
    fn repair_prompt_names_violations_and_paths() {
        let prompt = build_contract_repair_prompt(
            &strict_contract(),
            &["files count does not match contract".to_string()],
        );
        assert!(prompt.contains("files count does not match contract"));
        assert!(prompt.contains("one file"));
        assert!(prompt.contains("hello.txt"));
    }
}
