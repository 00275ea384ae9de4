use axum::{debug_handler, extract::{Path, State}, routing::{delete, get}, Json, Router};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{notice::Notice, session::SessionManager, store::{Key, Store}, AppResult, AppState, PeerError, PeerResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub collaborators: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Project {
    pub fn visible_to(&self, user: &str) -> bool {
        self.owner_id == user || self.collaborators.iter().any(|c| c == user)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub collaborators: Vec<String>,
}

#[derive(Clone)]
pub struct ProjectRegistry {
    store: Store,
}

impl ProjectRegistry {
    pub fn new(store: Store) -> ProjectRegistry {
        ProjectRegistry { store }
    }

    pub async fn create(&self, owner: &str, project: NewProject) -> PeerResult<Project> {
        let title = project.title.trim();
        let description = project.description.trim();
        if title.is_empty() || description.is_empty() {
            return Err(PeerError::Validation("Please fill in all required fields"));
        }

        let mut collaborators: Vec<String> = Vec::new();
        for id in project.collaborators.iter().map(|c| c.trim()) {
            if !id.is_empty() && id != owner && !collaborators.iter().any(|c| c == id) {
                collaborators.push(id.to_owned());
            }
        }

        let project = Project {
            id: "proj".to_owned() + &Uuid::now_v7().simple().to_string(),
            owner_id: owner.to_owned(),
            title: title.to_owned(),
            description: description.to_owned(),
            collaborators,
            created_at: OffsetDateTime::now_utc(),
        };

        self.store
            .update(Key::Projects, |projects: &mut Vec<Project>| {
                projects.push(project.clone());
                Ok(())
            })
            .await?;

        tracing::debug!("{owner} created {}", project.id);
        Ok(project)
    }

    /// Projects the user owns or collaborates on, newest first.
    pub async fn list_for_user(&self, user: &str) -> PeerResult<Vec<Project>> {
        let projects: Vec<Project> = self.store.load(Key::Projects).await?;
        // reversed first so the stable sort puts later insertions ahead on equal timestamps
        let mut visible: Vec<Project> = projects.into_iter().rev().filter(|p| p.visible_to(user)).collect();
        visible.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(visible)
    }

    pub async fn get(&self, id: &str) -> PeerResult<Project> {
        let projects: Vec<Project> = self.store.load(Key::Projects).await?;
        projects
            .into_iter()
            .find(|p| p.id == id)
            .ok_or(PeerError::NotFound("project"))
    }

    pub async fn delete(&self, project_id: &str, requester: &str) -> PeerResult<()> {
        self.store
            .update(Key::Projects, |projects: &mut Vec<Project>| {
                let pos = projects
                    .iter()
                    .position(|p| p.id == project_id)
                    .ok_or(PeerError::NotFound("project"))?;
                if projects[pos].owner_id != requester {
                    tracing::warn!("{requester} tried to delete {project_id}");
                    return Err(PeerError::Forbidden("Only the owner can delete this project"));
                }
                projects.remove(pos);
                Ok(())
            })
            .await
    }
}

#[derive(Serialize)]
struct Created {
    project: Project,
    notice: Notice,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/{id}", delete(remove))
}

#[debug_handler(state = AppState)]
async fn list(
    State(sessions): State<SessionManager>,
    State(projects): State<ProjectRegistry>,
    session: Session,
) -> AppResult<Json<Vec<Project>>> {
    let user = sessions.require_user(&session).await?;
    Ok(Json(projects.list_for_user(&user.id).await?))
}

#[debug_handler(state = AppState)]
async fn create(
    State(sessions): State<SessionManager>,
    State(projects): State<ProjectRegistry>,
    session: Session,
    Json(project): Json<NewProject>,
) -> AppResult<Json<Created>> {
    let user = sessions.require_user(&session).await?;
    let project = projects.create(&user.id, project).await?;
    Ok(Json(Created {
        project,
        notice: Notice::success("Success", "Project created successfully"),
    }))
}

#[debug_handler(state = AppState)]
async fn remove(
    State(sessions): State<SessionManager>,
    State(projects): State<ProjectRegistry>,
    Path(id): Path<String>,
    session: Session,
) -> AppResult<Json<Notice>> {
    let user = sessions.require_user(&session).await?;
    projects.delete(&id, &user.id).await?;
    Ok(Json(Notice::success("Success", "Project deleted")))
}
