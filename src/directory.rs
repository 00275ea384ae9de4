use std::collections::HashSet;

use axum::{debug_handler, extract::{Path, Query, State}, routing::get, Json, Router};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tower_sessions::Session;

use crate::{connections::ConnectionGraph, session::SessionManager, store::{Key, Store}, AppResult, AppState, PeerError, PeerResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub name: String,
    pub department: String,
    pub year: String,
    pub college_id: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub theme: Theme,
}

fn seed_user(id: &str, name: &str, department: &str, year: &str, college_id: &str, skills: &[&str], interests: &[&str], bio: &str) -> User {
    let owned = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
    User {
        id: id.to_owned(),
        username: name.to_owned(),
        name: name.to_owned(),
        department: department.to_owned(),
        year: year.to_owned(),
        college_id: college_id.to_owned(),
        skills: owned(skills),
        interests: owned(interests),
        bio: bio.to_owned(),
        theme: Theme::Light,
    }
}

/// The sample students every directory starts with.
pub fn seed_users() -> Vec<User> {
    vec![
        seed_user(
            "mock1", "Alex Johnson", "Computer Science", "Junior", "CS12345",
            &["JavaScript", "React", "Node.js"],
            &["Web Development", "AI", "Cybersecurity"],
            "Passionate about building web applications and learning new technologies.",
        ),
        seed_user(
            "mock2", "Sarah Williams", "Design", "Sophomore", "DS67890",
            &["UI/UX Design", "Figma", "Illustration"],
            &["Product Design", "User Research", "Frontend Development"],
            "Design enthusiast with a focus on creating intuitive user experiences.",
        ),
        seed_user(
            "mock3", "Michael Chen", "Engineering", "Senior", "EN34567",
            &["Python", "Data Analysis", "Machine Learning"],
            &["AI Research", "Robotics", "IoT"],
            "Interested in applying machine learning to solve real-world problems.",
        ),
    ]
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrowseFilter {
    pub search: Option<String>,
    pub department: Option<String>,
    pub year: Option<String>,
}

impl BrowseFilter {
    fn matches(&self, user: &User) -> bool {
        if let Some(term) = wanted(&self.search) {
            let term = term.to_lowercase();
            let hit = [&user.username, &user.name, &user.department]
                .iter()
                .any(|field| field.to_lowercase().contains(&term));
            if !hit {
                return false;
            }
        }
        if wanted(&self.department).is_some_and(|department| user.department != department) {
            return false;
        }
        if wanted(&self.year).is_some_and(|year| user.year != year) {
            return false;
        }
        true
    }
}

fn wanted(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowseStats {
    pub connections: usize,
    /// Not tracked; a placeholder number for the dashboard.
    pub profile_views: u32,
    pub skill_matches: usize,
}

#[derive(Clone)]
pub struct Directory {
    store: Store,
}

impl Directory {
    pub fn new(store: Store) -> Directory {
        Directory { store }
    }

    pub async fn registered(&self) -> PeerResult<Vec<User>> {
        self.store.load(Key::Users).await
    }

    /// Seed users first, then registered users in registration order. A
    /// registered user whose id collides with a seed id replaces that seed.
    pub async fn list_all(&self) -> PeerResult<Vec<User>> {
        Ok(merge(seed_users(), self.registered().await?))
    }

    pub async fn find(&self, id: &str) -> PeerResult<Option<User>> {
        Ok(self.list_all().await?.into_iter().find(|u| u.id == id))
    }

    pub async fn get(&self, id: &str) -> PeerResult<User> {
        self.find(id).await?.ok_or(PeerError::NotFound("user"))
    }

    pub async fn find_by_login(&self, username: &str, college_id: &str) -> PeerResult<Option<User>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .find(|u| u.username == username && u.college_id == college_id))
    }

    pub async fn browse(&self, viewer_id: &str, filter: &BrowseFilter) -> PeerResult<Vec<User>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|u| u.id != viewer_id && filter.matches(u))
            .collect())
    }

    pub async fn stats(&self, viewer: &User, connections: usize) -> PeerResult<BrowseStats> {
        let skills: HashSet<&str> = viewer.skills.iter().map(String::as_str).collect();
        let skill_matches = self
            .list_all()
            .await?
            .iter()
            .filter(|u| u.id != viewer.id && u.skills.iter().any(|s| skills.contains(s.as_str())))
            .count();

        Ok(BrowseStats {
            connections,
            profile_views: rand::rng().random_range(0..50),
            skill_matches,
        })
    }
}

pub(crate) fn merge(seeds: Vec<User>, registered: Vec<User>) -> Vec<User> {
    let registered_ids: HashSet<&str> = registered.iter().map(|u| u.id.as_str()).collect();
    let mut all: Vec<User> = seeds
        .into_iter()
        .filter(|u| !registered_ids.contains(u.id.as_str()))
        .collect();
    all.extend(registered);
    all
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(browse))
        .route("/stats", get(stats))
        .route("/{id}", get(peer))
}

#[debug_handler(state = AppState)]
async fn browse(
    State(sessions): State<SessionManager>,
    State(directory): State<Directory>,
    Query(filter): Query<BrowseFilter>,
    session: Session,
) -> AppResult<Json<Vec<User>>> {
    let viewer = sessions.require_user(&session).await?;
    Ok(Json(directory.browse(&viewer.id, &filter).await?))
}

#[debug_handler(state = AppState)]
async fn stats(
    State(sessions): State<SessionManager>,
    State(directory): State<Directory>,
    State(connections): State<ConnectionGraph>,
    session: Session,
) -> AppResult<Json<BrowseStats>> {
    let viewer = sessions.require_user(&session).await?;
    let connected = connections.peers(&viewer.id).await?.len();
    Ok(Json(directory.stats(&viewer, connected).await?))
}

#[debug_handler(state = AppState)]
async fn peer(
    State(sessions): State<SessionManager>,
    State(directory): State<Directory>,
    Path(id): Path<String>,
    session: Session,
) -> AppResult<Json<User>> {
    sessions.require_user(&session).await?;
    Ok(Json(directory.get(&id).await?))
}

#[cfg(test)]
pub(crate) fn test_user(id: &str, username: &str, college_id: &str) -> User {
    User {
        id: id.to_owned(),
        username: username.to_owned(),
        name: username.to_owned(),
        department: "CS".to_owned(),
        year: "2".to_owned(),
        college_id: college_id.to_owned(),
        skills: Vec::new(),
        interests: Vec::new(),
        bio: String::new(),
        theme: Theme::Light,
    }
}
