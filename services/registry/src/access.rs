//! Who may do what.

use std::sync::Arc;

use harbor_core::identity::Subject;
use harbor_core::model::{Project, Role};
use harbor_core::store::Store;
use harbor_core::{ErrorKind, RepositoryName, Result};

use crate::token::{Access, REGISTRY, REPOSITORY};

/// Pull a repository.
pub const PULL: &str = "pull";
/// Push to a repository.
pub const PUSH: &str = "push";
/// Delete from a repository.
pub const DELETE: &str = "delete";

/// Actions a project role grants on the project's repositories.
pub fn role_actions(role: Role) -> &'static [&'static str] {
    match role {
        Role::ProjectAdmin | Role::Maintainer => &[PULL, PUSH, DELETE],
        Role::Developer => &[PULL, PUSH],
        Role::Guest | Role::LimitedGuest => &[PULL],
    }
}

/// Evaluates requested scopes against project membership.
#[derive(Debug, Clone)]
pub struct AccessResolver {
    store: Arc<dyn Store>,
}

impl AccessResolver {
    /// A resolver reading projects and members from `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        AccessResolver { store }
    }

    /// Actions `subject` holds on `project`.
    pub async fn project_actions(&self, subject: &Subject, project: &Project) -> Result<Vec<&'static str>> {
        if subject.is_sysadmin() {
            return Ok(vec![PULL, PUSH, DELETE]);
        }
        let mut actions: Vec<&'static str> = Vec::new();
        if let Some(principal) = subject.principal() {
            if let Some(role) = self
                .store
                .member_role(project.id, &principal.username)
                .await?
            {
                actions.extend_from_slice(role_actions(role));
            }
        }
        if project.is_public() && !actions.contains(&PULL) {
            actions.push(PULL);
        }
        Ok(actions)
    }

    /// Whether `subject` may perform `action` on `repository`.
    pub async fn can(&self, subject: &Subject, repository: &str, action: &str) -> Result<bool> {
        Ok(self.held(subject, repository).await?.contains(&action))
    }

    /// The subset of `requested` that `subject` is granted. Denied actions
    /// are dropped; entries left with no actions are omitted.
    pub async fn grant(&self, subject: &Subject, requested: &Access) -> Result<Option<Access>> {
        let granted: Vec<String> = match requested.resource_type.as_str() {
            REGISTRY if requested.name == "catalog" && subject.is_sysadmin() => {
                requested.actions.clone()
            }
            REPOSITORY => {
                let held = self.held(subject, &requested.name).await?;
                requested
                    .actions
                    .iter()
                    .flat_map(|action| -> Vec<String> {
                        if action == "*" {
                            if held.len() == 3 {
                                vec!["*".to_owned()]
                            } else {
                                held.iter().map(|a| (*a).to_owned()).collect()
                            }
                        } else if held.contains(&action.as_str()) {
                            vec![action.clone()]
                        } else {
                            Vec::new()
                        }
                    })
                    .collect()
            }
            _ => Vec::new(),
        };
        if granted.is_empty() {
            return Ok(None);
        }
        Ok(Some(Access {
            resource_type: requested.resource_type.clone(),
            name: requested.name.clone(),
            actions: granted,
        }))
    }

    async fn held(&self, subject: &Subject, repository: &str) -> Result<Vec<&'static str>> {
        let Ok(name) = RepositoryName::new(repository) else {
            return Ok(Vec::new());
        };
        match self.store.get_project_by_name(name.project()).await {
            Ok(project) => self.project_actions(subject, &project).await,
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::identity::Principal;
    use harbor_core::model::{NewProject, ProjectMetadata};
    use harbor_core::store::{MemoryStore, ProjectStore};

    fn user(name: &str, sysadmin: bool) -> Subject {
        Subject::User(Principal {
            username: name.into(),
            sysadmin,
        })
    }

    async fn resolver() -> AccessResolver {
        let store = Arc::new(MemoryStore::new());
        for (name, public) in [("library", true), ("team", false)] {
            store
                .create_project(NewProject {
                    name: name.into(),
                    owner: "admin".into(),
                    metadata: ProjectMetadata {
                        public,
                        ..ProjectMetadata::default()
                    },
                    storage_limit: None,
                })
                .await
                .unwrap();
        }
        let team = store.get_project_by_name("team").await.unwrap();
        store.set_member(team.id, "dev", Role::Developer).await.unwrap();
        store.set_member(team.id, "guest", Role::Guest).await.unwrap();
        AccessResolver::new(store)
    }

    #[tokio::test]
    async fn denied_actions_are_dropped() {
        let resolver = resolver().await;
        let requested = Access::repository("team/app", &["pull", "push", "delete"]);

        let granted = resolver.grant(&user("dev", false), &requested).await.unwrap().unwrap();
        assert_eq!(granted.actions, vec!["pull", "push"]);

        let granted = resolver.grant(&user("guest", false), &requested).await.unwrap().unwrap();
        assert_eq!(granted.actions, vec!["pull"]);

        assert!(resolver.grant(&Subject::Anonymous, &requested).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn public_projects_are_pullable_by_anyone() {
        let resolver = resolver().await;
        let requested = Access::repository("library/nginx", &["pull", "push"]);
        let granted = resolver.grant(&Subject::Anonymous, &requested).await.unwrap().unwrap();
        assert_eq!(granted.actions, vec!["pull"]);
        assert!(resolver.can(&Subject::Anonymous, "library/nginx", PULL).await.unwrap());
        assert!(!resolver.can(&Subject::Anonymous, "missing/nginx", PULL).await.unwrap());
    }

    #[tokio::test]
    async fn catalog_is_for_admins() {
        let resolver = resolver().await;
        assert!(resolver.grant(&user("dev", false), &Access::catalog()).await.unwrap().is_none());
        assert_eq!(
            resolver.grant(&user("root", true), &Access::catalog()).await.unwrap(),
            Some(Access::catalog())
        );
        let all = Access::repository("team/app", &["*"]);
        let granted = resolver.grant(&user("root", true), &all).await.unwrap().unwrap();
        assert_eq!(granted.actions, vec!["*"]);
    }
}
