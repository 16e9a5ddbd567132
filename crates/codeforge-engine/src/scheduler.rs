//! Sub-task selection for the implementation loop.

use crate::plan::{OutputContract, TaskMode};
use codeforge_core::Container;
use serde::{Deserialize, Serialize};

/// What kind of work a coder sub-task is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoderTaskKind {
    /// Produce a file the architecture expects.
    ImplementComponent,
    /// Produce tests for an untested file.
    WriteTests,
    /// Satisfy the user description directly (micro and small tasks).
    Direct,
}

impl CoderTaskKind {
    /// Wire string for the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImplementComponent => "implement_component",
            Self::WriteTests => "write_tests",
            Self::Direct => "direct",
        }
    }
}

/// One scheduler-selected sub-task for the coder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoderTask {
    /// Task kind.
    pub kind: CoderTaskKind,
    /// Component the file belongs to, when architecture-driven.
    pub component: Option<String>,
    /// Target file, when one is pinned.
    pub file: Option<String>,
    /// Instruction handed to the coder.
    pub description: String,
    /// Path restriction for this sub-task.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
}

/// Pick the next sub-task: the first missing file per component, then the
/// first Python file lacking tests. `None` means the loop is done.
pub fn next_task(
    container: &Container,
    mode: TaskMode,
    contract: &OutputContract,
    user_description: &str,
) -> Option<CoderTask> {
    if let Some(architecture) = &container.target_architecture {
        for component in &architecture.components {
            for file in &component.files {
                if !container.files.contains_key(file) {
                    return Some(CoderTask {
                        kind: CoderTaskKind::ImplementComponent,
                        component: Some(component.name.clone()),
                        file: Some(file.clone()),
                        description: format!("Implement {} for {}", file, component.name),
                        allowed_paths: Vec::new(),
                    });
                }
            }
        }

        if let Some(file) = first_untested_python_file(container) {
            return Some(CoderTask {
                kind: CoderTaskKind::WriteTests,
                component: None,
                file: Some(format!("tests/test_{}", basename(&file))),
                description: format!("Write tests for {file}"),
                allowed_paths: Vec::new(),
            });
        }

        return None;
    }

    // No architecture: micro and small tasks get one direct pass at the
    // user description, considered done once any file exists.
    if mode != TaskMode::Project && container.files.is_empty() {
        let allowed_paths = contract.allowed_paths.clone().unwrap_or_default();
        return Some(CoderTask {
            kind: CoderTaskKind::Direct,
            component: None,
            file: allowed_paths.first().cloned(),
            description: user_description.to_string(),
            allowed_paths,
        });
    }

    None
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_test_file(path: &str) -> bool {
    let name = basename(path);
    name.starts_with("test_") || name.ends_with("_test.py") || path.starts_with("tests/")
}

fn has_tests_for(container: &Container, path: &str) -> bool {
    let name = basename(path);
    let candidates = [
        path.replace(".py", "_test.py"),
        format!("test_{path}"),
        format!("tests/test_{name}"),
        match path.rsplit_once('/') {
            Some((dir, file)) => format!("{dir}/test_{file}"),
            None => format!("test_{name}"),
        },
    ];
    candidates
        .iter()
        .any(|candidate| container.files.contains_key(candidate))
}

fn first_untested_python_file(container: &Container) -> Option<String> {
    container
        .files
        .keys()
        .find(|path| {
            path.ends_with(".py") && !is_test_file(path) && !has_tests_for(container, path)
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeforge_core::{ArchitectureDoc, ComponentSpec};

    fn architecture() -> ArchitectureDoc {
        ArchitectureDoc {
            name: "svc".into(),
            components: vec![
                ComponentSpec {
                    name: "API Layer".into(),
                    files: vec!["main.py".into(), "api/routes.py".into()],
                    ..Default::default()
                },
                ComponentSpec {
                    name: "Testing".into(),
                    files: vec!["tests/test_main.py".into()],
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn picks_first_missing_architecture_file() {
        let mut container = Container::new(None);
        container.target_architecture = Some(architecture());
        container.add_file("main.py", "x").unwrap();

        let task = next_task(
            &container,
            TaskMode::Project,
            &OutputContract::default(),
            "task",
        )
        .unwrap();
        assert_eq!(task.kind, CoderTaskKind::ImplementComponent);
        assert_eq!(task.file.as_deref(), Some("api/routes.py"));
        assert_eq!(task.component.as_deref(), Some("API Layer"));
    }

    #[test]
    fn then_picks_untested_files() {
        let mut container = Container::new(None);
        container.target_architecture = Some(architecture());
        container.add_file("main.py", "x").unwrap();
        container.add_file("api/routes.py", "y").unwrap();
        container.add_file("tests/test_main.py", "t").unwrap();

        // api/routes.py has no tests yet.
        let task = next_task(
            &container,
            TaskMode::Project,
            &OutputContract::default(),
            "task",
        )
        .unwrap();
        assert_eq!(task.kind, CoderTaskKind::WriteTests);
        assert!(task.description.contains("api/routes.py"));
    }

    #[test]
    fn done_when_everything_exists_and_is_tested() {
        let mut container = Container::new(None);
        container.target_architecture = Some(architecture());
        container.add_file("main.py", "x").unwrap();
        container.add_file("api/routes.py", "y").unwrap();
        container.add_file("tests/test_main.py", "t").unwrap();
        container.add_file("tests/test_routes.py", "t").unwrap();

        assert!(next_task(
            &container,
            TaskMode::Project,
            &OutputContract::default(),
            "task"
        )
        .is_none());
    }

    #[test]
    fn direct_task_for_micro_mode_runs_once() {
        let mut container = Container::new(None);
        let contract = OutputContract {
            allowed_paths: Some(vec!["hello.txt".into()]),
            ..OutputContract::default()
        };
        let task = next_task(&container, TaskMode::MicroFile, &contract, "write hello").unwrap();
        assert_eq!(task.kind, CoderTaskKind::Direct);
        assert_eq!(task.file.as_deref(), Some("hello.txt"));

        container.add_file("hello.txt", "hi").unwrap();
        assert!(next_task(&container, TaskMode::MicroFile, &contract, "write hello").is_none());
    }
}
