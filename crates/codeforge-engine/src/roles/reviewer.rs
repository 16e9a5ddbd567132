//! Reviewer: static checks, template checks, architecture compliance, and
//! the sandboxed tool passes.

use chrono::Utc;
use codeforge_core::codex::ReviewerRules;
use codeforge_core::template::{TEMPLATE_PYTHON_CLI, TEMPLATE_PYTHON_FASTAPI};
use codeforge_core::{
    ArtifactKind, CodeforgeResult, Container, FileContent, ReviewSummary, RoleKind, UsageGate,
};
use codeforge_runner::{command_line, CommandRecord, CommandRunner, TaskWorkspace};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

/// Reports from the three tool passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolReports {
    /// `ruff check .`
    pub ruff: Option<CommandRecord>,
    /// `python3 -m compileall .`
    pub compileall: Option<CommandRecord>,
    /// `python3 -m pytest -q`
    pub pytest: Option<CommandRecord>,
}

/// Full review report, recorded as the `review_report` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewReport {
    /// `approved` / `approved_with_warnings` / `rejected`.
    pub status: String,
    /// Whether the container passed the gate.
    pub passed: bool,
    /// Human-readable one-liner.
    pub message: String,
    /// Report timestamp, ISO-8601.
    pub timestamp: String,
    /// Static findings that block approval.
    pub issues: Vec<String>,
    /// Non-blocking findings.
    pub warnings: Vec<String>,
    /// Blocking findings including tool errors.
    pub errors: Vec<String>,
    /// Checks that passed, for the report reader.
    pub passed_checks: Vec<String>,
    /// Number of files reviewed.
    pub files_reviewed: usize,
    /// Checklist from the codex.
    pub checklist_used: Vec<String>,
    /// Tool pass reports.
    #[serde(flatten)]
    pub tools: ToolReports,
    /// Whether any tool pass hit its timeout.
    pub command_timeout: bool,
    /// Run ids of the tool passes.
    pub run_ids: Vec<String>,
    /// Aggregate counts.
    pub summary: serde_json::Value,
}

impl ReviewReport {
    /// Compact summary for task views and the repro manifest.
    pub fn to_summary(&self) -> ReviewSummary {
        ReviewSummary {
            passed: self.passed,
            status: self.status.clone(),
            issues_count: self.errors.len(),
            run_id: self.run_ids.first().cloned(),
        }
    }
}

/// The reviewer role.
pub struct Reviewer {
    rules: ReviewerRules,
}

impl Reviewer {
    /// Build a reviewer with the codex rules for the role.
    pub fn new(rules: ReviewerRules) -> Self {
        Self { rules }
    }

    /// Review the container. When a workspace and runner are provided the
    /// dynamic tool passes run; otherwise the review is static only.
    pub async fn execute(
        &self,
        container: &mut Container,
        workspace: Option<&TaskWorkspace>,
        runner: Option<&CommandRunner>,
        gate: &dyn UsageGate,
    ) -> CodeforgeResult<ReviewReport> {
        let template_id = container.metadata.template_id.clone();
        let mut issues = Vec::new();
        let mut warnings = Vec::new();
        let mut passed_checks = Vec::new();

        for (path, content) in &container.files {
            review_file(path, content, &mut issues, &mut warnings, &mut passed_checks);
        }

        if container.target_architecture.is_some()
            && !skip_architecture_compliance(template_id.as_deref())
        {
            for gap in container.architecture_gaps() {
                issues.push(gap);
            }
        }

        let test_file_count = container
            .files
            .keys()
            .filter(|path| path.to_lowercase().contains("test"))
            .count();
        if test_file_count == 0 {
            warnings.push("No test files found".to_string());
        } else {
            passed_checks.push(format!("Found {test_file_count} test files"));
        }

        if container.progress < 0.5 && container.history.len() > 10 {
            warnings.push(format!(
                "Low progress ({:.0}%) after {} recorded changes",
                container.progress * 100.0,
                container.history.len()
            ));
        }

        let doc_files = container
            .files
            .keys()
            .filter(|path| path.ends_with(".md"))
            .count();
        if doc_files == 0 {
            warnings.push("No documentation files found".to_string());
        } else {
            passed_checks.push(format!("Found {doc_files} documentation files"));
        }

        apply_template_checks(
            template_id.as_deref(),
            &container.files,
            &mut issues,
            &mut warnings,
            &mut passed_checks,
        );

        let mut tools = ToolReports::default();
        let mut tool_warnings = Vec::new();
        let mut tool_errors = Vec::new();
        if container.files.is_empty() {
            tool_warnings.push("No files available for quality checks".to_string());
        } else if let (Some(workspace), Some(runner)) = (workspace, runner) {
            workspace.materialize(container)?;
            self.run_quality_checks(
                container,
                workspace,
                runner,
                gate,
                &mut tools,
                &mut tool_warnings,
                &mut tool_errors,
            )
            .await?;
            // Pick up anything the tool passes rewrote on disk.
            workspace.sync_to_container(container)?;
        }
        warnings.extend(tool_warnings);

        let mut errors = issues.clone();
        errors.extend(tool_errors);

        let timed_out = [&tools.ruff, &tools.compileall, &tools.pytest]
            .into_iter()
            .flatten()
            .any(|report| report.timed_out);
        let passed = errors.is_empty() && !timed_out;
        let (status, message) = if passed && !warnings.is_empty() {
            (
                "approved_with_warnings".to_string(),
                format!("Approved with {} warnings", warnings.len()),
            )
        } else if passed {
            ("approved".to_string(), "All checks passed".to_string())
        } else {
            (
                "rejected".to_string(),
                format!("Found {} critical issues", errors.len()),
            )
        };

        let run_ids = [&tools.ruff, &tools.compileall, &tools.pytest]
            .into_iter()
            .flatten()
            .map(|report| report.run_id.clone())
            .collect();

        let report = ReviewReport {
            status,
            passed,
            message,
            timestamp: Utc::now().to_rfc3339(),
            summary: json!({
                "total_files": container.files.len(),
                "total_issues": issues.len(),
                "total_warnings": warnings.len(),
                "test_coverage": format!("{}/{} files", test_file_count, container.files.len()),
                "progress": container.progress,
            }),
            issues,
            warnings,
            errors,
            passed_checks,
            files_reviewed: container.files.len(),
            checklist_used: self.rules.checklist.clone(),
            tools,
            command_timeout: timed_out,
            run_ids,
        };

        container.add_artifact(
            ArtifactKind::ReviewReport,
            serde_json::to_value(&report)?,
            RoleKind::Reviewer.to_string(),
        );
        info!(
            status = %report.status,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "review complete"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_quality_checks(
        &self,
        container: &Container,
        workspace: &TaskWorkspace,
        runner: &CommandRunner,
        gate: &dyn UsageGate,
        tools: &mut ToolReports,
        warnings: &mut Vec<String>,
        errors: &mut Vec<String>,
    ) -> CodeforgeResult<()> {
        let owner = container.metadata.owner_key_hash.as_deref();
        let has_python = container.files.keys().any(|path| path.ends_with(".py"));
        let has_tests = container
            .files
            .keys()
            .any(|path| path.to_lowercase().contains("test"));

        if !has_python {
            warnings.push("Ruff skipped: no python files found".to_string());
            warnings.push("Compileall skipped: no python files found".to_string());
        } else {
            gate.check_command_budget(owner).await?;
            let ruff = runner
                .run(
                    &command_line(["ruff", "check", "."]),
                    Some(workspace.path()),
                    Some("ruff"),
                    &[],
                )
                .await?;
            gate.record_command_run(owner).await;
            if ruff.error.as_deref() == Some("command_not_found") {
                errors.push("ruff executable not found".to_string());
            } else if let Some(error) = &ruff.error {
                errors.push(format!("ruff error: {error}"));
            } else if ruff.exit_code != Some(0) {
                warnings.push(format!(
                    "ruff reported issues (exit code {})",
                    ruff.exit_code.unwrap_or(-1)
                ));
            }
            tools.ruff = Some(ruff);

            gate.check_command_budget(owner).await?;
            let compileall = runner
                .run(
                    &command_line(["python3", "-m", "compileall", "."]),
                    Some(workspace.path()),
                    Some("compileall"),
                    &[],
                )
                .await?;
            gate.record_command_run(owner).await;
            if compileall.error.as_deref() == Some("command_not_found") {
                warnings.push("python3 executable not found".to_string());
            } else if let Some(error) = &compileall.error {
                errors.push(format!("compileall error: {error}"));
            } else if compileall.exit_code.is_some_and(|code| code != 0) {
                errors.push(format!(
                    "compileall failed with exit code {}",
                    compileall.exit_code.unwrap_or(-1)
                ));
            }
            tools.compileall = Some(compileall);
        }

        if has_tests && has_python {
            gate.check_command_budget(owner).await?;
            let pytest = runner
                .run(
                    &command_line(["python3", "-m", "pytest", "-q"]),
                    Some(workspace.path()),
                    Some("pytest"),
                    &[(
                        "PYTHONPATH".to_string(),
                        workspace.path().display().to_string(),
                    )],
                )
                .await?;
            gate.record_command_run(owner).await;
            if pytest.error.as_deref() == Some("command_not_found") {
                errors.push("pytest executable not found".to_string());
            } else if let Some(error) = &pytest.error {
                errors.push(format!("pytest error: {error}"));
            } else if pytest.exit_code.is_some_and(|code| code != 0 && code != 5) {
                // Exit code 5 is "no tests collected".
                errors.push(format!(
                    "pytest failed with exit code {}",
                    pytest.exit_code.unwrap_or(-1)
                ));
            }
            tools.pytest = Some(pytest);
        } else if has_python {
            warnings.push("Pytest skipped: no test files found".to_string());
        }

        Ok(())
    }
}

fn skip_architecture_compliance(template_id: Option<&str>) -> bool {
    matches!(
        template_id,
        Some(TEMPLATE_PYTHON_CLI) | Some(TEMPLATE_PYTHON_FASTAPI)
    )
}

fn review_file(
    path: &str,
    content: &FileContent,
    issues: &mut Vec<String>,
    warnings: &mut Vec<String>,
    passed: &mut Vec<String>,
) {
    let Some(text) = content.as_text() else {
        return;
    };
    let lines: Vec<&str> = text.lines().collect();

    let long_lines: Vec<(usize, usize)> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.chars().count() > 120)
        .map(|(index, line)| (index + 1, line.chars().count()))
        .collect();
    if long_lines.is_empty() {
        passed.push(format!("{path}: All lines within 120 characters"));
    } else {
        let mut line_info: Vec<String> = long_lines
            .iter()
            .take(3)
            .map(|(number, length)| format!("line {number}({length} chars)"))
            .collect();
        if long_lines.len() > 3 {
            line_info.push(format!("and {} more", long_lines.len() - 3));
        }
        warnings.push(format!("{path}: Lines too long: {}", line_info.join(", ")));
    }

    if !path.ends_with(".py") {
        return;
    }

    let has_module_doc = lines
        .iter()
        .take(5)
        .any(|line| line.trim_start().starts_with("\"\"\"") || line.trim_start().starts_with("'''"));
    if has_module_doc {
        passed.push(format!("{path}: Has module docstring"));
    } else {
        warnings.push(format!("{path}: Missing module docstring"));
    }

    for (index, line) in lines.iter().enumerate() {
        let stripped = line.trim_start();
        if !(stripped.starts_with("def ") || stripped.starts_with("class ")) {
            continue;
        }
        let next_is_doc = |offset: usize| {
            lines
                .get(index + offset)
                .map(|l| {
                    let t = l.trim_start();
                    t.starts_with("\"\"\"") || t.starts_with("'''")
                })
                .unwrap_or(false)
        };
        if !next_is_doc(1) && !next_is_doc(2) {
            let name = stripped
                .split_whitespace()
                .nth(1)
                .unwrap_or("")
                .split('(')
                .next()
                .unwrap_or("")
                .trim_end_matches(':');
            warnings.push(format!(
                "{path}:{}: Function/class '{name}' missing docstring",
                index + 1
            ));
        }
    }

    if let Some(problem) = python_syntax_sanity(text) {
        issues.push(format!("{path}: Syntax error - {problem}"));
    } else {
        passed.push(format!("{path}: No syntax errors"));
    }

    let import_count = lines
        .iter()
        .filter(|line| {
            let t = line.trim_start();
            t.starts_with("import ") || t.starts_with("from ")
        })
        .count();
    if import_count > 0 {
        passed.push(format!("{path}: Has {import_count} import statements"));
    }
}

/// Cheap structural sanity check for Python sources: bracket balance and
/// string termination, tracked outside string literals. Not a parser; it
/// catches the truncation and fence-residue failures models actually
/// produce.
fn python_syntax_sanity(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut stack: Vec<u8> = Vec::new();
    let mut index = 0;
    let mut string_delim: Option<(u8, bool)> = None; // (quote, triple)

    while index < bytes.len() {
        let byte = bytes[index];
        if let Some((quote, triple)) = string_delim {
            if byte == b'\\' && !triple {
                index += 2;
                continue;
            }
            if byte == quote {
                if triple {
                    if bytes[index..].starts_with(&[quote, quote, quote]) {
                        string_delim = None;
                        index += 3;
                        continue;
                    }
                } else {
                    string_delim = None;
                }
            } else if byte == b'\n' && !triple {
                // Unterminated single-line string.
                return Some("unterminated string literal".to_string());
            }
            index += 1;
            continue;
        }
        match byte {
            b'#' => {
                while index < bytes.len() && bytes[index] != b'\n' {
                    index += 1;
                }
                continue;
            }
            b'"' | b'\'' => {
                let triple = bytes[index..].starts_with(&[byte, byte, byte]);
                string_delim = Some((byte, triple));
                index += if triple { 3 } else { 1 };
                continue;
            }
            b'(' | b'[' | b'{' => stack.push(byte),
            b')' | b']' | b'}' => {
                let expected = match byte {
                    b')' => b'(',
                    b']' => b'[',
                    _ => b'{',
                };
                if stack.pop() != Some(expected) {
                    return Some(format!("unbalanced '{}'", byte as char));
                }
            }
            _ => {}
        }
        index += 1;
    }

    if let Some(open) = stack.last() {
        return Some(format!("unclosed '{}'", *open as char));
    }
    if let Some((quote, true)) = string_delim {
        return Some(format!("unterminated triple-quoted {} string", quote as char));
    }
    if string_delim.is_some() {
        return Some("unterminated string literal".to_string());
    }
    None
}

fn apply_template_checks(
    template_id: Option<&str>,
    files: &BTreeMap<String, FileContent>,
    issues: &mut Vec<String>,
    warnings: &mut Vec<String>,
    passed: &mut Vec<String>,
) {
    match template_id {
        Some(TEMPLATE_PYTHON_CLI) => {
            let has_readme = files
                .keys()
                .any(|path| path.rsplit('/').next().unwrap_or(path).eq_ignore_ascii_case("readme.md"));
            if has_readme {
                passed.push("README.md found".to_string());
            } else {
                issues.push("README.md is required for python_cli template".to_string());
            }
        }
        Some(TEMPLATE_PYTHON_FASTAPI) => {
            let requirements = files
                .get("requirements.txt")
                .and_then(FileContent::as_text)
                .unwrap_or_default();
            let missing: Vec<&str> = ["fastapi", "uvicorn[standard]", "pydantic"]
                .into_iter()
                .filter(|dep| !requirements.contains(dep))
                .collect();
            if missing.is_empty() {
                passed.push("FastAPI dependencies present in requirements.txt".to_string());
            } else {
                issues.push(format!(
                    "Missing FastAPI dependencies in requirements.txt: {}",
                    missing.join(", ")
                ));
            }

            let python_sources = || {
                files
                    .iter()
                    .filter(|(path, _)| path.ends_with(".py"))
                    .filter_map(|(_, content)| content.as_text())
            };
            if !python_sources().any(|text| text.contains("FastAPI(")) {
                issues.push("FastAPI app instance not found".to_string());
            }
            if !python_sources()
                .any(|text| text.contains("@app.") || text.contains("include_router"))
            {
                warnings.push("No FastAPI routes detected".to_string());
            }
            if python_sources()
                .any(|text| text.contains("\"/health\"") || text.contains("'/health'"))
            {
                passed.push("Health endpoint found".to_string());
            } else {
                issues.push("Missing /health endpoint for FastAPI template".to_string());
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeforge_core::UnlimitedGate;

    async fn review(container: &mut Container) -> ReviewReport {
        Reviewer::new(ReviewerRules::default())
            .execute(container, None, None, &UnlimitedGate)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn clean_project_is_approved_with_warnings_only() {
        let mut container = Container::new(None);
        container
            .add_file(
                "main.py",
                "\"\"\"Entry point.\"\"\"\n\n\ndef main():\n    \"\"\"Run.\"\"\"\n    return 0\n",
            )
            .unwrap();
        container
            .add_file(
                "tests/test_main.py",
                "\"\"\"Tests.\"\"\"\n\n\ndef test_main():\n    \"\"\"Check.\"\"\"\n    assert True\n",
            )
            .unwrap();
        container.add_file("README.md", "# Project\n").unwrap();

        let report = review(&mut container).await;
        assert!(report.passed);
        assert_eq!(report.status, "approved");
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn syntax_problem_rejects() {
        let mut container = Container::new(None);
        container
            .add_file("broken.py", "\"\"\"Doc.\"\"\"\ndef f(:\n    return (1\n")
            .unwrap();
        let report = review(&mut container).await;
        assert!(!report.passed);
        assert_eq!(report.status, "rejected");
        assert!(report.errors.iter().any(|e| e.contains("Syntax error")));
    }

    #[tokio::test]
    async fn missing_docstrings_are_warnings_not_errors() {
        let mut container = Container::new(None);
        container
            .add_file("app.py", "\"\"\"Doc.\"\"\"\ndef f():\n    return 1\n")
            .unwrap();
        container.add_file("tests/test_app.py", "\"\"\"T.\"\"\"\n").unwrap();
        container.add_file("README.md", "# x\n").unwrap();
        let report = review(&mut container).await;
        assert!(report.passed);
        assert_eq!(report.status, "approved_with_warnings");
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("missing docstring")));
    }

    #[tokio::test]
    async fn architecture_gaps_reject() {
        let mut container = Container::new(None);
        container.target_architecture = Some(codeforge_core::ArchitectureDoc {
            name: "svc".into(),
            components: vec![codeforge_core::ComponentSpec {
                name: "api".into(),
                files: vec!["missing.py".into()],
                ..Default::default()
            }],
            ..Default::default()
        });
        container.add_file("present.py", "\"\"\"Doc.\"\"\"\n").unwrap();
        let report = review(&mut container).await;
        assert!(!report.passed);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("missing file: missing.py")));
    }

    #[tokio::test]
    async fn fastapi_template_requires_health_endpoint() {
        let mut container = Container::new(None);
        container.metadata.template_id = Some(TEMPLATE_PYTHON_FASTAPI.to_string());
        container
            .add_file(
                "main.py",
                "\"\"\"App.\"\"\"\nfrom fastapi import FastAPI\n\napp = FastAPI()\n\n\n@app.get(\"/items\")\ndef items():\n    \"\"\"List.\"\"\"\n    return []\n",
            )
            .unwrap();
        container
            .add_file("requirements.txt", "fastapi\nuvicorn[standard]\npydantic\n")
            .unwrap();
        let report = review(&mut container).await;
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("Missing /health endpoint")));

        container
            .add_file(
                "main.py",
                "\"\"\"App.\"\"\"\nfrom fastapi import FastAPI\n\napp = FastAPI()\n\n\n@app.get(\"/health\")\ndef health():\n    \"\"\"Health.\"\"\"\n    return {\"status\": \"ok\"}\n",
            )
            .unwrap();
        let report = review(&mut container).await;
        assert!(!report
            .errors
            .iter()
            .any(|e| e.contains("Missing /health endpoint")));
    }

    #[tokio::test]
    async fn unrunnable_tool_passes_reject() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = TaskWorkspace::new("rev-tools", tmp.path());
        workspace.ensure().unwrap();
        // An allowlist without the review tools: every pass is refused
        // before spawn, and a review whose tools never ran must not approve.
        let runner = CommandRunner::new(workspace.path()).with_allowed_commands(["true"]);

        let mut container = Container::new(None);
        container
            .add_file("app.py", "\"\"\"Doc.\"\"\"\nX = 1\n")
            .unwrap();
        let report = Reviewer::new(ReviewerRules::default())
            .execute(&mut container, Some(&workspace), Some(&runner), &UnlimitedGate)
            .await
            .unwrap();

        assert!(!report.passed);
        assert_eq!(report.status, "rejected");
        assert!(report.errors.iter().any(|e| e.starts_with("ruff error:")));
        assert!(report
            .errors
            .iter()
            .any(|e| e.starts_with("compileall error:")));
    }

    #[test]
    fn sanity_check_accepts_valid_python() {
        let code = "\"\"\"Doc.\"\"\"\nimport os\n\n\ndef f(x):\n    \"\"\"D.\"\"\"\n    return {'a': [1, 2], 'b': (3,)}\n";
        assert!(python_syntax_sanity(code).is_none());
    }

    #[test]
    fn sanity_check_flags_unbalanced_brackets() {
        assert!(python_syntax_sanity("def f():\n    return (1\n").is_some());
        assert!(python_syntax_sanity("x = [1, 2\n").is_some());
    }

    #[test]
    fn sanity_check_ignores_brackets_in_strings_and_comments() {
        assert!(python_syntax_sanity("x = \"(((\"\n# )))\n").is_none());
        assert!(python_syntax_sanity("doc = \"\"\"unclosed ( bracket\"\"\"\n").is_none());
    }

    #[test]
    fn sanity_check_flags_unterminated_strings() {
        assert!(python_syntax_sanity("x = \"abc\n").is_some());
        assert!(python_syntax_sanity("x = \"\"\"abc\n").is_some());
    }
}
