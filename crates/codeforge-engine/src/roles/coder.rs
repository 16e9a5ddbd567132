//! Coder: one scheduler-selected sub-task in, validated files out.

use crate::contract::validate_output_contract;
use crate::plan::OutputContract;
use crate::scheduler::CoderTask;
use chrono::Utc;
use codeforge_core::codex::CoderRules;
use codeforge_core::template::TEMPLATE_PYTHON_FASTAPI;
use codeforge_core::{
    assert_allowed, normalize_rel_path, ArtifactKind, CodeforgeError, CodeforgeResult, Container,
    LlmUsageUpdate, RoleKind, UsageGate, UsageReport,
};
use codeforge_llm::{parse_llm_json, truncate_preview, ChatMessage, GenerateOptions, LlmGateway};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Result of one successful coder pass.
#[derive(Debug, Clone)]
pub struct CoderOutcome {
    /// Paths written this pass, in order.
    pub files: Vec<String>,
    /// First written path, when any.
    pub primary_file: Option<String>,
    /// Usage attribution for the LLM call.
    pub usage_report: UsageReport,
    /// Which summary artifact the model provided
    /// (`implementation_plan` or `code_summary`).
    pub artifact_kind: ArtifactKind,
}

/// The coder role.
pub struct Coder {
    rules: CoderRules,
}

impl Coder {
    /// Build a coder with the codex rules for the role.
    pub fn new(rules: CoderRules) -> Self {
        Self { rules }
    }

    /// Execute one sub-task: call the model in JSON mode, validate the
    /// response against the contract, and write the files.
    ///
    /// The LLM call is recorded against the container and the daily gate
    /// even when parsing fails afterwards, so budget counters see every
    /// call.
    pub async fn execute(
        &self,
        task: &CoderTask,
        container: &mut Container,
        gateway: &LlmGateway,
        contract: &OutputContract,
        correction_prompt: Option<&str>,
        gate: &dyn UsageGate,
    ) -> CodeforgeResult<CoderOutcome> {
        let owner = container.metadata.owner_key_hash.clone();
        gate.check_llm_budget(owner.as_deref()).await?;

        let allowed_paths = self.effective_allowed_paths(task, container);
        let messages = self.build_messages(task, container, &allowed_paths, correction_prompt);

        let started_at = Utc::now().to_rfc3339();
        let response = gateway
            .generate_with_retry(&messages, GenerateOptions {
                require_json: true,
                max_tokens_override: None,
            })
            .await?;
        let finished_at = Utc::now().to_rfc3339();

        container.record_llm_usage(LlmUsageUpdate {
            stage: "implementation".into(),
            provider: gateway.provider_name().to_string(),
            model: gateway.settings().model.clone(),
            tokens_in: response.usage.input_tokens,
            tokens_out: response.usage.output_tokens,
            metadata: Some(json!({ "task_type": task.kind.as_str() })),
        });
        gate.record_tokens(
            owner.as_deref(),
            response.usage.input_tokens,
            response.usage.output_tokens,
        )
        .await;

        let parsed = match parse_llm_json(&response.text) {
            Ok(value) => value,
            Err(err) => {
                if let CodeforgeError::ResponseParse { message, .. } = &err {
                    container.add_artifact(
                        ArtifactKind::LlmInvalidJson,
                        json!({
                            "reason": "llm_invalid_json",
                            "error": message,
                            "response_preview": truncate_preview(&response.text),
                        }),
                        RoleKind::Coder.to_string(),
                    );
                }
                return Err(err);
            }
        };

        validate_output_contract(contract, &response.text, &parsed)?;

        let mut files = collect_file_entries(&parsed, task.file.as_deref());
        if files.is_empty() {
            return Err(CodeforgeError::ContractViolation {
                violations: vec!["response included no files to write".to_string()],
            });
        }
        if files.len() > self.rules.max_files_per_iteration {
            warn!(
                returned = files.len(),
                cap = self.rules.max_files_per_iteration,
                "coder returned more files than allowed, truncating"
            );
            files.truncate(self.rules.max_files_per_iteration);
        }

        let all_paths: BTreeSet<String> = container
            .files
            .keys()
            .cloned()
            .chain(files.iter().map(|(path, _)| path.clone()))
            .collect();
        let template_id = container.metadata.template_id.clone();

        let mut written = Vec::new();
        for (path, content) in files {
            let path = normalize_rel_path(&path)?;
            assert_allowed(&path, &allowed_paths)?;
            let content = sanitize_fastapi_root_layout(
                template_id.as_deref(),
                &path,
                content,
                &all_paths,
            );
            let size = content.len();
            let lines = content.lines().count();
            container.add_file(&path, content)?;
            container.add_artifact(
                ArtifactKind::Code,
                json!({
                    "file": &path,
                    "task": &task.description,
                    "generated_at": Utc::now().to_rfc3339(),
                    "size": size,
                    "lines": lines,
                }),
                RoleKind::Coder.to_string(),
            );
            written.push(path);
        }

        let usage_report = UsageReport {
            stage: "implementation".into(),
            provider: gateway.provider_name().to_string(),
            model: gateway.settings().model.clone(),
            tokens_in: response.usage.input_tokens,
            tokens_out: response.usage.output_tokens,
            total_tokens: response.usage.input_tokens + response.usage.output_tokens,
            started_at,
            finished_at,
            task: Some(task.description.clone()),
        };
        container.add_artifact(
            ArtifactKind::UsageReport,
            serde_json::to_value(&usage_report)?,
            RoleKind::Coder.to_string(),
        );

        let artifacts = parsed.get("artifacts").and_then(Value::as_object);
        let (artifact_kind, summary) = match artifacts {
            Some(map) if map.contains_key("implementation_plan") => (
                ArtifactKind::ImplementationPlan,
                map.get("implementation_plan").cloned().unwrap_or_default(),
            ),
            Some(map) if map.contains_key("code_summary") => (
                ArtifactKind::CodeSummary,
                map.get("code_summary").cloned().unwrap_or_default(),
            ),
            _ => (
                ArtifactKind::CodeSummary,
                json!(format!("Updated files: {}", written.join(", "))),
            ),
        };
        container.add_artifact(artifact_kind.clone(), summary, RoleKind::Coder.to_string());

        info!(files = ?written, task_type = task.kind.as_str(), "coder pass complete");
        Ok(CoderOutcome {
            primary_file: written.first().cloned(),
            files: written,
            usage_report,
            artifact_kind,
        })
    }

    fn effective_allowed_paths(&self, task: &CoderTask, container: &Container) -> Vec<String> {
        if !task.allowed_paths.is_empty() {
            return task.allowed_paths.clone();
        }
        container.metadata.allowed_paths.clone()
    }

    fn build_messages(
        &self,
        task: &CoderTask,
        container: &Container,
        allowed_paths: &[String],
        correction_prompt: Option<&str>,
    ) -> Vec<ChatMessage> {
        let context = container.relevant_context(RoleKind::Coder);
        let mut constraints = self.rules.constraints.clone();
        if container.metadata.template_id.as_deref() == Some(TEMPLATE_PYTHON_FASTAPI) {
            constraints.push(
                "Use root layout with main.py at the repository root. \
                 Do not create an app/ directory. \
                 Only import modules that exist in the generated files; \
                 do not import api.* unless an api/ package is created."
                    .to_string(),
            );
        }
        let payload = json!({
            "Task": task.description,
            "Type": task.kind.as_str(),
            "Component": task.component,
            "Target file": task.file,
            "Allowed paths": allowed_paths,
            "Existing files": context["files"],
            "Architecture": context["architecture"],
            "Recent changes": context["recent_changes"],
            "Constraints": constraints,
        });
        let mut messages = vec![
            ChatMessage::system(
                "You are the Coder agent. Follow the codex rules strictly.\n\
                 Return JSON only with fields: files (list of {path, content}), \
                 artifacts (object with implementation_plan or code_summary).\n\
                 Do not include secrets or API keys in outputs.",
            ),
            ChatMessage::user(payload.to_string()),
        ];
        if let Some(correction) = correction_prompt {
            messages.push(ChatMessage::user(correction.to_string()));
        }
        messages
    }
}

fn collect_file_entries(parsed: &Value, target_file: Option<&str>) -> Vec<(String, String)> {
    let mut files = Vec::new();
    if let Some(entries) = parsed.get("files").and_then(Value::as_array) {
        for entry in entries {
            push_entry(&mut files, entry);
        }
    }
    if let Some(entry) = parsed.get("file").filter(|v| v.is_object()) {
        push_entry(&mut files, entry);
    }
    if files.is_empty() {
        if let (Some(content), Some(path)) = (
            parsed.get("content").and_then(Value::as_str),
            target_file.filter(|p| !p.is_empty()),
        ) {
            files.push((path.to_string(), content.to_string()));
        }
    }
    files
}

fn push_entry(files: &mut Vec<(String, String)>, entry: &Value) {
    let path = entry
        .get("path")
        .or_else(|| entry.get("file"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    if path.is_empty() {
        return;
    }
    let content = entry
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    files.push((path, content));
}

/// Strip dead `api.*` imports from a FastAPI root-layout `main.py` when no
/// `api/` module exists; they would fail the reviewer's compile pass.
fn sanitize_fastapi_root_layout(
    template_id: Option<&str>,
    path: &str,
    content: String,
    all_paths: &BTreeSet<String>,
) -> String {
    if template_id != Some(TEMPLATE_PYTHON_FASTAPI) {
        return content;
    }
    if path != "main.py" && path != "app/main.py" {
        return content;
    }
    let has_api_module = all_paths
        .iter()
        .any(|candidate| candidate == "api.py" || candidate.starts_with("api/"));
    if has_api_module {
        return content;
    }
    let mut removed = false;
    let filtered: Vec<&str> = content
        .lines()
        .filter(|line| {
            let stripped = line.trim_start();
            if stripped.starts_with("from api") || stripped.starts_with("import api") {
                removed = true;
                return false;
            }
            if line.contains("api_router") {
                removed = true;
                return false;
            }
            true
        })
        .collect();
    if !removed {
        return content;
    }
    let mut sanitized = filtered.join("\n");
    if content.ends_with('\n') {
        sanitized.push('\n');
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::CoderTaskKind;
    use codeforge_core::UnlimitedGate;
    use codeforge_llm::{LlmSettings, ScriptedProvider};
    use std::sync::Arc;

    fn task(file: Option<&str>) -> CoderTask {
        CoderTask {
            kind: CoderTaskKind::ImplementComponent,
            component: Some("API".into()),
            file: file.map(str::to_string),
            description: "Implement main.py for API".into(),
            allowed_paths: Vec::new(),
        }
    }

    fn gateway(texts: Vec<String>) -> LlmGateway {
        LlmGateway::new(
            Arc::new(ScriptedProvider::from_texts(texts)),
            LlmSettings::default(),
        )
    }

    #[tokio::test]
    async fn writes_files_and_artifacts() {
        let response = json!({
            "files": [{"path": "main.py", "content": "print('ok')\n"}],
            "artifacts": {"implementation_plan": "1. do it"}
        });
        let mut container = Container::new(None);
        let outcome = Coder::new(CoderRules::default())
            .execute(
                &task(Some("main.py")),
                &mut container,
                &gateway(vec![response.to_string()]),
                &OutputContract::default(),
                None,
                &UnlimitedGate,
            )
            .await
            .unwrap();

        assert_eq!(outcome.files, vec!["main.py"]);
        assert_eq!(outcome.artifact_kind, ArtifactKind::ImplementationPlan);
        assert!(container.files.contains_key("main.py"));
        assert_eq!(container.artifacts[&ArtifactKind::Code].len(), 1);
        assert_eq!(container.artifacts[&ArtifactKind::UsageReport].len(), 1);
        assert_eq!(container.llm_call_count(), 1);
    }

    #[tokio::test]
    async fn unparseable_response_records_preview_artifact() {
        let mut container = Container::new(None);
        let err = Coder::new(CoderRules::default())
            .execute(
                &task(None),
                &mut container,
                &gateway(vec!["I refuse to answer in JSON".to_string()]),
                &OutputContract::default(),
                None,
                &UnlimitedGate,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CodeforgeError::ResponseParse { .. }));
        assert_eq!(container.artifacts[&ArtifactKind::LlmInvalidJson].len(), 1);
        // The failed call still counts against budgets.
        assert_eq!(container.llm_call_count(), 1);
    }

    #[tokio::test]
    async fn traversal_paths_are_rejected() {
        let response = json!({
            "files": [{"path": "../escape.py", "content": "x"}]
        });
        let mut container = Container::new(None);
        let err = Coder::new(CoderRules::default())
            .execute(
                &task(None),
                &mut container,
                &gateway(vec![response.to_string()]),
                &OutputContract::default(),
                None,
                &UnlimitedGate,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CodeforgeError::UnsafePath(_)));
        assert!(container.files.is_empty());
    }

    #[tokio::test]
    async fn file_count_is_capped() {
        let files: Vec<Value> = (0..8)
            .map(|i| json!({"path": format!("f{i}.py"), "content": "x"}))
            .collect();
        let response = json!({ "files": files });
        let mut container = Container::new(None);
        let outcome = Coder::new(CoderRules::default())
            .execute(
                &task(None),
                &mut container,
                &gateway(vec![response.to_string()]),
                &OutputContract::default(),
                None,
                &UnlimitedGate,
            )
            .await
            .unwrap();
        assert_eq!(outcome.files.len(), 5);
    }

    #[tokio::test]
    async fn contract_violation_bubbles_for_repair() {
        let response = json!({
            "files": [{"path": "wrong.txt", "content": "hi"}]
        });
        let contract = OutputContract {
            exact_json_only: true,
            allowed_files_count: Some(1),
            allowed_paths: Some(vec!["hello.txt".into()]),
            no_extra_files: true,
            no_extra_text_outside_json: true,
            ..OutputContract::default()
        };
        let mut container = Container::new(None);
        let err = Coder::new(CoderRules::default())
            .execute(
                &task(Some("hello.txt")),
                &mut container,
                &gateway(vec![response.to_string()]),
                &contract,
                None,
                &UnlimitedGate,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CodeforgeError::ContractViolation { .. }));
    }

    #[test]
    fn fastapi_sanitizer_strips_dead_api_imports() {
        let mut paths = BTreeSet::new();
        paths.insert("main.py".to_string());
        let content = "from api.routes import router as api_router\nimport api\napp = 1\napp2 = 2\n";
        let sanitized = sanitize_fastapi_root_layout(
            Some(TEMPLATE_PYTHON_FASTAPI),
            "main.py",
            content.to_string(),
            &paths,
        );
        assert_eq!(sanitized, "app = 1\napp2 = 2\n");

        // With an api/ module present, nothing is stripped.
        paths.insert("api/routes.py".to_string());
        let untouched = sanitize_fastapi_root_layout(
            Some(TEMPLATE_PYTHON_FASTAPI),
            "main.py",
            content.to_string(),
            &paths,
        );
        assert_eq!(untouched, content);
    }
}
