use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use validator::Validate;

use super::graph;
use crate::error::{AppError, Result};
use crate::models::Playbook;

/// Read access to published playbook definitions
#[async_trait]
pub trait PlaybookRepository: Send + Sync {
    /// Fetch a playbook by id, at `version` or the latest version when `None`
    async fn get_playbook(&self, id: &str, version: Option<u32>) -> Result<Arc<Playbook>>;

    /// Latest version of every playbook
    async fn list_playbooks(&self) -> Result<Vec<Arc<Playbook>>>;

    /// Publish a new immutable version
    async fn publish(&self, playbook: Playbook) -> Result<Arc<Playbook>>;
}

/// Field and graph validation applied before a playbook is accepted
pub fn validate_definition(playbook: &Playbook) -> Result<()> {
    playbook.validate()?;
    graph::validate(playbook)?;
    Ok(())
}

/// Playbook catalog keeping every published version in memory
#[derive(Clone, Default)]
pub struct InMemoryPlaybookRepository {
    playbooks: Arc<DashMap<String, BTreeMap<u32, Arc<Playbook>>>>,
}

impl InMemoryPlaybookRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `.yaml`, `.yml` and `.json` playbook in `dir`.
    /// Returns the number of playbooks published.
    pub async fn load_dir(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("yaml") | Some("yml") | Some("json")
                )
            })
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let content = tokio::fs::read_to_string(&path).await?;
            let playbook: Playbook = match path.extension().and_then(|ext| ext.to_str()) {
                Some("json") => serde_json::from_str(&content)?,
                _ => serde_yaml::from_str(&content)?,
            };

            let playbook = self.publish(playbook).await.map_err(|e| {
                AppError::Validation(format!("{}: {}", path.display(), e))
            })?;
            tracing::info!(
                playbook_id = %playbook.id,
                version = playbook.version,
                path = %path.display(),
                "Loaded playbook"
            );
            loaded += 1;
        }

        Ok(loaded)
    }

    /// Every published version of `id`, oldest first
    pub fn versions(&self, id: &str) -> Vec<u32> {
        self.playbooks
            .get(id)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PlaybookRepository for InMemoryPlaybookRepository {
    async fn get_playbook(&self, id: &str, version: Option<u32>) -> Result<Arc<Playbook>> {
        let versions = self
            .playbooks
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("Playbook {} not found", id)))?;

        let found = match version {
            Some(version) => versions.get(&version),
            None => versions.values().next_back(),
        };

        found.cloned().ok_or_else(|| {
            AppError::NotFound(format!(
                "Playbook {} version {} not found",
                id,
                version.map_or_else(|| "latest".to_string(), |v| v.to_string())
            ))
        })
    }

    async fn list_playbooks(&self) -> Result<Vec<Arc<Playbook>>> {
        let mut playbooks: Vec<Arc<Playbook>> = self
            .playbooks
            .iter()
            .filter_map(|entry| entry.value().values().next_back().cloned())
            .collect();
        playbooks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(playbooks)
    }

    async fn publish(&self, playbook: Playbook) -> Result<Arc<Playbook>> {
        validate_definition(&playbook)?;

        let mut versions = self.playbooks.entry(playbook.id.clone()).or_default();
        if let Some((&latest, _)) = versions.iter().next_back() {
            if playbook.version <= latest {
                return Err(AppError::Conflict(format!(
                    "Playbook {} version {} must be greater than published version {}",
                    playbook.id, playbook.version, latest
                )));
            }
        }

        let playbook = Arc::new(playbook);
        versions.insert(playbook.version, playbook.clone());

        tracing::info!(
            playbook_id = %playbook.id,
            version = playbook.version,
            steps = playbook.steps.len(),
            "Playbook published"
        );
        Ok(playbook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PlaybookStep;
    use tempfile::TempDir;

    fn playbook(version: u32) -> Playbook {
        Playbook::new(
            "containment",
            "Containment",
            vec![
                PlaybookStep::new("a", "wait"),
                PlaybookStep::new("b", "wait").depends_on(["a"]),
            ],
        )
        .with_version(version)
    }

    #[tokio::test]
    async fn test_publish_and_get_versions() {
        let repo = InMemoryPlaybookRepository::new();
        repo.publish(playbook(1)).await.unwrap();
        repo.publish(playbook(3)).await.unwrap();

        assert_eq!(repo.get_playbook("containment", None).await.unwrap().version, 3);
        assert_eq!(repo.get_playbook("containment", Some(1)).await.unwrap().version, 1);
        assert!(matches!(
            repo.get_playbook("containment", Some(2)).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            repo.get_playbook("missing", None).await,
            Err(AppError::NotFound(_))
        ));
        assert_eq!(repo.versions("containment"), vec![1, 3]);
        assert_eq!(repo.list_playbooks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_versions_strictly_increase() {
        let repo = InMemoryPlaybookRepository::new();
        repo.publish(playbook(2)).await.unwrap();

        assert!(matches!(
            repo.publish(playbook(2)).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            repo.publish(playbook(1)).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_rejects_cycles() {
        let repo = InMemoryPlaybookRepository::new();
        let cyclic = Playbook::new(
            "loop",
            "Loop",
            vec![
                PlaybookStep::new("a", "wait").depends_on(["b"]),
                PlaybookStep::new("b", "wait").depends_on(["a"]),
            ],
        );

        assert!(matches!(repo.publish(cyclic).await, Err(AppError::Graph(_))));
        assert!(repo.versions("loop").is_empty());
    }

    #[tokio::test]
    async fn test_load_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("phishing.yaml"),
            r#"
id: phishing-response
name: Phishing Response
version: 1
status: active
steps:
  - id: quarantine
    action: wait
    params: { duration_ms: 1 }
  - id: notify
    action: log
    depends_on: [quarantine]
    params: { message: "quarantined" }
"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("ddos.json"),
            r#"{"id": "ddos", "name": "DDoS", "version": 2, "steps": []}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.txt"), "ignored").unwrap();

        let repo = InMemoryPlaybookRepository::new();
        assert_eq!(repo.load_dir(dir.path()).await.unwrap(), 2);
        assert_eq!(
            repo.get_playbook("phishing-response", None)
                .await
                .unwrap()
                .steps
                .len(),
            2
        );
        assert_eq!(repo.get_playbook("ddos", Some(2)).await.unwrap().version, 2);
    }
}
