use shared::TaskKind;
use std::collections::BTreeMap;
use std::str::FromStr;
use strum::IntoEnumIterator;

use super::artifact::ArtifactSpec;
use crate::config::{AppConfig, ConfigError};

/// Maps every task to exactly one model artifact.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    artifacts: BTreeMap<TaskKind, ArtifactSpec>,
}

impl ModelRegistry {
    pub fn new(artifacts: BTreeMap<TaskKind, ArtifactSpec>) -> Result<Self, ConfigError> {
        if let Some(missing) = TaskKind::iter().find(|task| !artifacts.contains_key(task)) {
            return Err(ConfigError::MissingModel(missing));
        }
        Ok(Self { artifacts })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        Self::new(config.models.clone())
    }

    /// Parses a client-supplied task name. `None` means the task is unknown.
    pub fn resolve(&self, task: &str) -> Option<TaskKind> {
        TaskKind::from_str(task.trim())
            .ok()
            .filter(|kind| self.artifacts.contains_key(kind))
    }

    pub fn spec(&self, task: TaskKind) -> Option<&ArtifactSpec> {
        self.artifacts.get(&task)
    }

    pub fn tasks(&self) -> impl Iterator<Item = (TaskKind, &ArtifactSpec)> {
        self.artifacts.iter().map(|(task, spec)| (*task, spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(name: &str) -> ArtifactSpec {
        ArtifactSpec {
            path: PathBuf::from(format!("models/{}.pt", name)),
            labels: vec!["negative".into(), "positive".into()],
        }
    }

    fn full() -> BTreeMap<TaskKind, ArtifactSpec> {
        TaskKind::iter().map(|t| (t, spec(t.as_ref()))).collect()
    }

    #[test]
    fn resolves_known_names_and_aliases() {
        let registry = ModelRegistry::new(full()).unwrap();
        assert_eq!(registry.resolve("xray"), Some(TaskKind::ChestXray));
        assert_eq!(registry.resolve(" Eye "), Some(TaskKind::EyeDefect));
        assert_eq!(registry.resolve("unknown_task"), None);
        assert_eq!(registry.resolve(""), None);
        assert_eq!(registry.tasks().count(), 3);
    }

    #[test]
    fn every_task_needs_an_artifact() {
        let mut artifacts = full();
        artifacts.remove(&TaskKind::EyeDefect);
        assert!(matches!(
            ModelRegistry::new(artifacts),
            Err(ConfigError::MissingModel(TaskKind::EyeDefect))
        ));
    }
}
