//! Designer: turns requirements into the target architecture.

use chrono::Utc;
use codeforge_core::template::{TEMPLATE_PYTHON_CLI, TEMPLATE_PYTHON_FASTAPI};
use codeforge_core::{
    ArchitectureDoc, ArtifactKind, CodeforgeError, CodeforgeResult, ComponentSpec, Container,
    LlmUsageUpdate, RoleKind,
};
use codeforge_llm::{parse_llm_json, ChatMessage, GenerateOptions, LlmGateway};
use serde_json::json;
use tracing::{info, warn};

/// The designer role.
pub struct Designer;

impl Designer {
    /// Create the architecture from the recorded requirements, set it as the
    /// container's target, and write the design documents.
    pub async fn execute(
        &self,
        container: &mut Container,
        gateway: &LlmGateway,
    ) -> CodeforgeResult<ArchitectureDoc> {
        if container
            .artifacts
            .get(&ArtifactKind::Requirements)
            .map_or(true, Vec::is_empty)
        {
            return Err(CodeforgeError::Orchestrator(
                "no requirements found for design".into(),
            ));
        }

        let context = container.relevant_context(RoleKind::Designer);
        let messages = [
            ChatMessage::system(
                "You are the Designer agent. Return JSON only with fields: \
                 name, description, components (list of {name, responsibility, technology, \
                 files, dependencies, endpoints}), data_model. \
                 Every file a component needs must be listed under its files.",
            ),
            ChatMessage::user(json!({ "Context": context }).to_string()),
        ];
        let response = gateway
            .generate_with_retry(&messages, GenerateOptions {
                require_json: true,
                max_tokens_override: None,
            })
            .await?;

        container.record_llm_usage(LlmUsageUpdate {
            stage: "design".into(),
            provider: gateway.provider_name().to_string(),
            model: gateway.settings().model.clone(),
            tokens_in: response.usage.input_tokens,
            tokens_out: response.usage.output_tokens,
            metadata: None,
        });

        let mut architecture = parse_llm_json(&response.text)
            .ok()
            .and_then(|value| serde_json::from_value::<ArchitectureDoc>(value).ok())
            .filter(|doc| !doc.components.is_empty())
            .unwrap_or_else(|| {
                warn!("designer response unusable, using the template layout");
                fallback_architecture(container.metadata.template_id.as_deref())
            });
        architecture.created_at = Utc::now().to_rfc3339();

        container.target_architecture = Some(architecture.clone());
        container.add_artifact(
            ArtifactKind::Architecture,
            serde_json::to_value(&architecture)?,
            RoleKind::Designer.to_string(),
        );
        container.add_file("architecture.md", architecture_markdown(&architecture))?;
        container.add_file(
            "implementation_plan.md",
            implementation_plan_markdown(&architecture),
        )?;

        info!(
            components = architecture.components.len(),
            "designer complete"
        );
        Ok(architecture)
    }
}

fn fallback_architecture(template_id: Option<&str>) -> ArchitectureDoc {
    let components = match template_id {
        Some(TEMPLATE_PYTHON_FASTAPI) => vec![
            ComponentSpec {
                name: "Application".into(),
                responsibility: "HTTP endpoints and wiring".into(),
                technology: "FastAPI".into(),
                files: vec!["main.py".into(), "requirements.txt".into(), "README.md".into()],
                ..Default::default()
            },
            ComponentSpec {
                name: "Testing".into(),
                responsibility: "API tests".into(),
                technology: "pytest".into(),
                files: vec!["tests/test_main.py".into()],
                dependencies: vec!["Application".into()],
                ..Default::default()
            },
        ],
        Some(TEMPLATE_PYTHON_CLI) => vec![
            ComponentSpec {
                name: "CLI".into(),
                responsibility: "Command-line entry point".into(),
                technology: "Python".into(),
                files: vec!["cli.py".into(), "README.md".into()],
                ..Default::default()
            },
            ComponentSpec {
                name: "Testing".into(),
                responsibility: "CLI tests".into(),
                technology: "pytest".into(),
                files: vec!["tests/test_cli.py".into()],
                dependencies: vec!["CLI".into()],
                ..Default::default()
            },
        ],
        _ => vec![
            ComponentSpec {
                name: "Application".into(),
                responsibility: "Core implementation".into(),
                technology: "Python".into(),
                files: vec!["main.py".into(), "README.md".into(), "requirements.txt".into()],
                ..Default::default()
            },
            ComponentSpec {
                name: "Testing".into(),
                responsibility: "Tests".into(),
                technology: "pytest".into(),
                files: vec!["tests/test_main.py".into()],
                dependencies: vec!["Application".into()],
                ..Default::default()
            },
        ],
    };
    ArchitectureDoc {
        name: "Generated project".into(),
        description: "Layout derived from the task template".into(),
        created_at: String::new(),
        components,
        data_model: None,
    }
}

fn architecture_markdown(doc: &ArchitectureDoc) -> String {
    let mut md = format!("# Architecture: {}\n\n{}\n\n## Components\n", doc.name, doc.description);
    for component in &doc.components {
        md.push_str(&format!(
            "\n### {}\n- Responsibility: {}\n- Technology: {}\n",
            component.name, component.responsibility, component.technology
        ));
        if !component.files.is_empty() {
            md.push_str("- Files:\n");
            for file in &component.files {
                md.push_str(&format!("  - `{file}`\n"));
            }
        }
        if !component.endpoints.is_empty() {
            md.push_str("- Endpoints:\n");
            for endpoint in &component.endpoints {
                md.push_str(&format!("  - `{endpoint}`\n"));
            }
        }
    }
    md.push_str(&format!("\n---\n*Created at: {}*\n", doc.created_at));
    md
}

fn implementation_plan_markdown(doc: &ArchitectureDoc) -> String {
    let mut md = String::from("# Implementation Plan\n\n");
    let mut step = 1;
    for component in &doc.components {
        for file in &component.files {
            md.push_str(&format!("{step}. Implement `{file}` ({})\n", component.name));
            step += 1;
        }
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeforge_llm::{LlmSettings, ScriptedProvider};
    use std::sync::Arc;

    fn container_with_requirements() -> Container {
        let mut container = Container::new(None);
        container.add_artifact(
            ArtifactKind::Requirements,
            json!({"user_task": "build"}),
            "researcher",
        );
        container
    }

    fn gateway(texts: Vec<String>) -> LlmGateway {
        LlmGateway::new(
            Arc::new(ScriptedProvider::from_texts(texts)),
            LlmSettings::default(),
        )
    }

    #[tokio::test]
    async fn structured_architecture_is_applied() {
        let response = json!({
            "name": "Todo API",
            "description": "CRUD service",
            "components": [
                {"name": "API", "responsibility": "routes", "technology": "FastAPI",
                 "files": ["main.py"], "dependencies": [], "endpoints": ["GET /todos"]}
            ]
        });
        let mut container = container_with_requirements();
        let architecture = Designer
            .execute(&mut container, &gateway(vec![response.to_string()]))
            .await
            .unwrap();
        assert_eq!(architecture.name, "Todo API");
        assert!(container.target_architecture.is_some());
        assert!(container.files.contains_key("architecture.md"));
        assert!(container.files.contains_key("implementation_plan.md"));
    }

    #[tokio::test]
    async fn unusable_response_uses_template_fallback() {
        let mut container = container_with_requirements();
        container.metadata.template_id = Some(TEMPLATE_PYTHON_CLI.to_string());
        let architecture = Designer
            .execute(&mut container, &gateway(vec!["no json".to_string()]))
            .await
            .unwrap();
        assert!(architecture
            .components
            .iter()
            .any(|c| c.files.contains(&"cli.py".to_string())));
    }

    #[tokio::test]
    async fn missing_requirements_is_an_error() {
        let mut container = Container::new(None);
        let err = Designer
            .execute(&mut container, &gateway(vec!["{}".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, CodeforgeError::Orchestrator(_)));
    }
}
