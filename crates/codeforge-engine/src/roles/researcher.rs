//! Researcher: turns the user task into structured requirements, and pauses
//! the pipeline when required clarifications are unanswered.

use chrono::Utc;
use codeforge_core::codex::ResearcherRules;
use codeforge_core::{
    ArtifactKind, ClarificationQuestion, CodeforgeResult, Container, LlmUsageUpdate,
    RequirementItem, RequirementsDoc, RoleKind,
};
use codeforge_llm::{parse_llm_json, ChatMessage, GenerateOptions, LlmGateway};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Result of one researcher pass.
#[derive(Debug, Clone)]
pub enum ResearchOutcome {
    /// Requirements were produced and recorded.
    Complete(RequirementsDoc),
    /// Required questions are unanswered; the task must pause.
    NeedsClarification(Vec<ClarificationQuestion>),
}

/// The researcher role.
pub struct Researcher {
    rules: ResearcherRules,
}

impl Researcher {
    /// Build a researcher with the codex rules for the role.
    pub fn new(rules: ResearcherRules) -> Self {
        Self { rules }
    }

    /// Analyze the user task. When the model asks required questions that
    /// `provided_answers` does not cover, the pass pauses without recording
    /// requirements, so a resume re-runs this role with the answers.
    pub async fn execute(
        &self,
        user_task: &str,
        container: &mut Container,
        gateway: &LlmGateway,
        provided_answers: &BTreeMap<String, String>,
    ) -> CodeforgeResult<ResearchOutcome> {
        info!(task = %truncate(user_task, 100), "researcher starting");
        let messages = self.build_messages(user_task, container, provided_answers);
        let response = gateway
            .generate_with_retry(&messages, GenerateOptions {
                require_json: true,
                max_tokens_override: None,
            })
            .await?;

        container.record_llm_usage(LlmUsageUpdate {
            stage: "research".into(),
            provider: gateway.provider_name().to_string(),
            model: gateway.settings().model.clone(),
            tokens_in: response.usage.input_tokens,
            tokens_out: response.usage.output_tokens,
            metadata: None,
        });

        let mut doc = parse_llm_json(&response.text)
            .ok()
            .and_then(|value| serde_json::from_value::<RequirementsDoc>(value).ok())
            .filter(|doc| !doc.requirements.is_empty() || !doc.user_stories.is_empty())
            .unwrap_or_else(|| {
                warn!("researcher response unusable, deriving requirements from the task text");
                fallback_requirements(user_task)
            });
        doc.user_task = user_task.to_string();
        doc.analyzed_at = Utc::now().to_rfc3339();
        doc.questions_to_user
            .truncate(self.rules.max_questions as usize);

        let unanswered: Vec<ClarificationQuestion> = doc
            .questions_to_user
            .iter()
            .filter(|q| q.required)
            .filter(|q| {
                provided_answers
                    .get(&q.id)
                    .map(|a| a.trim().is_empty())
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if !unanswered.is_empty() {
            info!(questions = unanswered.len(), "researcher needs clarification");
            return Ok(ResearchOutcome::NeedsClarification(unanswered));
        }

        for (question_id, answer) in provided_answers {
            doc.assumptions
                .push(format!("User answered '{question_id}': {answer}"));
        }

        container.add_artifact(
            ArtifactKind::Requirements,
            serde_json::to_value(&doc)?,
            RoleKind::Researcher.to_string(),
        );
        container.add_file("requirements.md", requirements_markdown(&doc))?;
        container.add_file("user_stories.md", user_stories_markdown(&doc))?;

        info!(
            requirements = doc.requirements.len(),
            user_stories = doc.user_stories.len(),
            "researcher complete"
        );
        Ok(ResearchOutcome::Complete(doc))
    }

    fn build_messages(
        &self,
        user_task: &str,
        container: &Container,
        provided_answers: &BTreeMap<String, String>,
    ) -> Vec<ChatMessage> {
        let context = container.relevant_context(RoleKind::Researcher);
        let payload = json!({
            "Task": user_task,
            "Context": context,
            "Provided answers": provided_answers,
            "Max questions": self.rules.max_questions,
        });
        vec![
            ChatMessage::system(
                "You are the Researcher agent. Analyze the task and return JSON only with fields: \
                 requirements (list of {id, description, priority, category}), \
                 user_stories (list of strings), assumptions (list of strings), \
                 technical_constraints (list of strings), \
                 questions_to_user (list of {id, text, type, required, rationale}). \
                 Only ask questions that block the work.",
            ),
            ChatMessage::user(payload.to_string()),
        ]
    }
}

fn fallback_requirements(user_task: &str) -> RequirementsDoc {
    RequirementsDoc {
        user_task: user_task.to_string(),
        analyzed_at: Utc::now().to_rfc3339(),
        requirements: vec![RequirementItem {
            id: "REQ-001".into(),
            description: user_task.to_string(),
            priority: "high".into(),
            category: "functional".into(),
        }],
        user_stories: vec![format!("As a user, I want to: {user_task}")],
        assumptions: vec!["Derived directly from the task description".to_string()],
        questions_to_user: Vec::new(),
        technical_constraints: Vec::new(),
    }
}

fn requirements_markdown(doc: &RequirementsDoc) -> String {
    let mut md = format!("# Requirements Analysis\n\n## Original Task\n{}\n\n## Requirements\n", doc.user_task);
    for requirement in &doc.requirements {
        md.push_str(&format!(
            "\n### {} ({})\n{}\n*Category: {}*\n",
            requirement.id,
            requirement.priority.to_uppercase(),
            requirement.description,
            requirement.category
        ));
    }
    md.push_str("\n## User Stories\n");
    for story in &doc.user_stories {
        md.push_str(&format!("\n- {story}"));
    }
    md.push_str("\n\n## Technical Constraints\n");
    for constraint in &doc.technical_constraints {
        md.push_str(&format!("\n- {constraint}"));
    }
    md.push_str("\n\n## Assumptions\n");
    for assumption in &doc.assumptions {
        md.push_str(&format!("\n- {assumption}"));
    }
    if !doc.questions_to_user.is_empty() {
        md.push_str("\n\n## Questions for Clarification\n");
        for question in &doc.questions_to_user {
            md.push_str(&format!("\n- {}", question.text));
        }
    }
    md.push_str(&format!("\n\n---\n*Analyzed at: {}*\n", doc.analyzed_at));
    md
}

fn user_stories_markdown(doc: &RequirementsDoc) -> String {
    let mut md = String::from("## User Stories\n\n");
    for story in &doc.user_stories {
        md.push_str(&format!("- {story}\n"));
    }
    md
}

fn truncate(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeforge_llm::{LlmSettings, ScriptedProvider};
    use std::sync::Arc;

    fn gateway(texts: Vec<String>) -> LlmGateway {
        LlmGateway::new(
            Arc::new(ScriptedProvider::from_texts(texts)),
            LlmSettings::default(),
        )
    }

    #[tokio::test]
    async fn parses_structured_requirements() {
        let response = json!({
            "requirements": [
                {"id": "REQ-001", "description": "Expose a REST API", "priority": "high", "category": "functional"}
            ],
            "user_stories": ["As a user, I want to create items"],
            "assumptions": [],
            "technical_constraints": ["Python 3.11+"],
            "questions_to_user": []
        });
        let mut container = Container::new(None);
        let researcher = Researcher::new(ResearcherRules::default());
        let outcome = researcher
            .execute(
                "Build an API",
                &mut container,
                &gateway(vec![response.to_string()]),
                &BTreeMap::new(),
            )
            .await
            .unwrap();

        match outcome {
            ResearchOutcome::Complete(doc) => {
                assert_eq!(doc.requirements.len(), 1);
                assert_eq!(doc.user_task, "Build an API");
            }
            ResearchOutcome::NeedsClarification(_) => panic!("should not pause"),
        }
        assert!(container.files.contains_key("requirements.md"));
        assert!(container.files.contains_key("user_stories.md"));
        assert_eq!(container.metadata.llm_usage.len(), 1);
    }

    #[tokio::test]
    async fn unusable_response_falls_back_to_derived_requirements() {
        let mut container = Container::new(None);
        let researcher = Researcher::new(ResearcherRules::default());
        let outcome = researcher
            .execute(
                "Build a CLI",
                &mut container,
                &gateway(vec!["not json at all".to_string()]),
                &BTreeMap::new(),
            )
            .await
            .unwrap();
        match outcome {
            ResearchOutcome::Complete(doc) => {
                assert_eq!(doc.requirements[0].id, "REQ-001");
                assert!(doc.user_stories[0].contains("Build a CLI"));
            }
            ResearchOutcome::NeedsClarification(_) => panic!("should not pause"),
        }
    }

    #[tokio::test]
    async fn required_question_pauses_without_artifacts() {
        let response = json!({
            "requirements": [{"id": "REQ-001", "description": "x", "priority": "high", "category": "functional"}],
            "user_stories": ["story"],
            "questions_to_user": [
                {"id": "q1", "text": "Which fields?", "required": true},
                {"id": "q2", "text": "Pagination?", "required": false}
            ]
        });
        let mut container = Container::new(None);
        let researcher = Researcher::new(ResearcherRules::default());
        let outcome = researcher
            .execute(
                "Build an API",
                &mut container,
                &gateway(vec![response.to_string()]),
                &BTreeMap::new(),
            )
            .await
            .unwrap();
        match outcome {
            ResearchOutcome::NeedsClarification(questions) => {
                assert_eq!(questions.len(), 1);
                assert_eq!(questions[0].id, "q1");
            }
            ResearchOutcome::Complete(_) => panic!("should pause"),
        }
        assert!(container.artifacts.get(&ArtifactKind::Requirements).is_none());
        assert!(!container.files.contains_key("requirements.md"));
    }

    #[tokio::test]
    async fn answers_unblock_and_land_in_assumptions() {
        let response = json!({
            "requirements": [{"id": "REQ-001", "description": "x", "priority": "high", "category": "functional"}],
            "user_stories": ["story"],
            "questions_to_user": [{"id": "q1", "text": "Which fields?", "required": true}]
        });
        let mut container = Container::new(None);
        let researcher = Researcher::new(ResearcherRules::default());
        let mut answers = BTreeMap::new();
        answers.insert("q1".to_string(), "title and body".to_string());
        let outcome = researcher
            .execute(
                "Build an API",
                &mut container,
                &gateway(vec![response.to_string()]),
                &answers,
            )
            .await
            .unwrap();
        match outcome {
            ResearchOutcome::Complete(doc) => {
                assert!(doc
                    .assumptions
                    .iter()
                    .any(|a| a.contains("q1") && a.contains("title and body")));
            }
            ResearchOutcome::NeedsClarification(_) => panic!("answers should unblock"),
        }
    }
}
