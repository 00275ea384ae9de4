use std::str::FromStr;

use axum::{debug_handler, extract::State, routing::{get, post, put}, Json, Router};
use serde::Deserialize;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{directory::{Directory, Theme, User}, store::{Key, Store}, AppResult, AppState, PeerError, PeerResult};

pub const CURRENT_USER: &str = "current_user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginPolicy {
    /// An unknown (username, college id) pair is registered on the spot.
    CreateMissing,
    Strict,
}

impl FromStr for LoginPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "create-missing" => Ok(LoginPolicy::CreateMissing),
            "strict" => Ok(LoginPolicy::Strict),
            other => anyhow::bail!("unknown login policy {other:?}, expected create-missing or strict"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub username: String,
    pub department: String,
    pub year: String,
    pub college_id: String,
}

impl Registration {
    fn trimmed(self) -> PeerResult<Registration> {
        let form = Registration {
            username: self.username.trim().to_owned(),
            department: self.department.trim().to_owned(),
            year: self.year.trim().to_owned(),
            college_id: self.college_id.trim().to_owned(),
        };
        if [&form.username, &form.department, &form.year, &form.college_id].iter().any(|f| f.is_empty()) {
            return Err(PeerError::Validation("Please fill in all fields"));
        }
        Ok(form)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    pub name: String,
    pub department: String,
    pub year: String,
    pub college_id: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub interests: Vec<String>,
}

/// Splits a comma separated tag list, dropping blanks.
pub fn parse_tags(input: &str) -> Vec<String> {
    clean_tags(input.split(','))
}

fn clean_tags<'a>(tags: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    tags.into_iter()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

#[derive(Clone)]
pub struct SessionManager {
    store: Store,
    directory: Directory,
    policy: LoginPolicy,
}

impl SessionManager {
    pub fn new(store: Store, directory: Directory, policy: LoginPolicy) -> SessionManager {
        SessionManager { store, directory, policy }
    }

    pub async fn current_user(&self, session: &Session) -> PeerResult<Option<User>> {
        Ok(session.get::<User>(CURRENT_USER).await?)
    }

    pub async fn require_user(&self, session: &Session) -> PeerResult<User> {
        self.current_user(session).await?.ok_or(PeerError::Unauthenticated)
    }

    pub async fn register(&self, session: &Session, form: Registration) -> PeerResult<User> {
        let form = form.trimmed()?;
        let user = self.create_user(form).await?;
        session.insert(CURRENT_USER, &user).await?;
        tracing::info!("registered @{}#{} as {}", user.username, user.college_id, user.id);
        Ok(user)
    }

    pub async fn login(&self, session: &Session, form: Registration) -> PeerResult<User> {
        let form = form.trimmed()?;
        let user = match self.directory.find_by_login(&form.username, &form.college_id).await? {
            Some(user) => user,
            None if self.policy == LoginPolicy::CreateMissing => {
                let user = self.create_user(form).await?;
                tracing::info!("created @{}#{} on login", user.username, user.college_id);
                user
            }
            None => return Err(PeerError::NotFound("user")),
        };

        session.insert(CURRENT_USER, &user).await?;
        tracing::info!("welcome @{}#{}", user.username, user.id);
        Ok(user)
    }

    pub async fn logout(&self, session: &Session) -> PeerResult<()> {
        if let Some(user) = self.current_user(session).await? {
            tracing::info!("bye @{}", user.username);
        }
        session.flush().await?;
        Ok(())
    }

    pub async fn update_theme(&self, session: &Session, user_id: &str, theme: Theme) -> PeerResult<()> {
        self.store
            .update(Key::Users, |users: &mut Vec<User>| {
                if let Some(user) = users.iter_mut().find(|u| u.id == user_id) {
                    user.theme = theme;
                }
                Ok(())
            })
            .await?;

        if let Some(mut current) = self.current_user(session).await? {
            if current.id == user_id {
                current.theme = theme;
                session.insert(CURRENT_USER, &current).await?;
            }
        }

        self.store.set(Key::Theme, &theme).await
    }

    pub async fn update_profile(&self, session: &Session, update: ProfileUpdate) -> PeerResult<User> {
        let current = self.require_user(session).await?;

        let name = update.name.trim();
        let department = update.department.trim();
        let year = update.year.trim();
        let college_id = update.college_id.trim();
        if [name, department, year, college_id].iter().any(|f| f.is_empty()) {
            return Err(PeerError::Validation("Please fill in all required fields"));
        }
        let seeds = crate::directory::seed_users();

        let updated = self
            .store
            .update(Key::Users, |users: &mut Vec<User>| {
                let taken = seeds
                    .iter()
                    .chain(users.iter())
                    .any(|u| u.id != current.id && u.college_id == college_id);
                if taken {
                    tracing::warn!("{} cannot take college id {college_id}", current.id);
                    return Err(PeerError::DuplicateIdentity);
                }

                // the stored record wins over a possibly stale session copy
                let base = users
                    .iter()
                    .chain(seeds.iter())
                    .find(|u| u.id == current.id)
                    .cloned()
                    .unwrap_or(current);
                let updated = User {
                    name: name.to_owned(),
                    department: department.to_owned(),
                    year: year.to_owned(),
                    college_id: college_id.to_owned(),
                    bio: update.bio.trim().to_owned(),
                    skills: clean_tags(update.skills.iter().map(String::as_str)),
                    interests: clean_tags(update.interests.iter().map(String::as_str)),
                    ..base
                };

                match users.iter_mut().find(|u| u.id == updated.id) {
                    Some(user) => *user = updated.clone(),
                    // seed users become registered once edited
                    None => users.push(updated.clone()),
                }
                Ok(updated)
            })
            .await?;

        session.insert(CURRENT_USER, &updated).await?;
        tracing::debug!("profile of {} updated", updated.id);
        Ok(updated)
    }

    async fn create_user(&self, form: Registration) -> PeerResult<User> {
        let theme = self.store.get_or(Key::Theme, Theme::default()).await?;
        let seeds = crate::directory::seed_users();

        self.store
            .update(Key::Users, |users: &mut Vec<User>| {
                let taken = seeds
                    .iter()
                    .chain(users.iter())
                    .any(|u| u.username == form.username || u.college_id == form.college_id);
                if taken {
                    tracing::warn!("registration of @{}#{} collides", form.username, form.college_id);
                    return Err(PeerError::DuplicateIdentity);
                }

                let user = User {
                    id: "user".to_owned() + &Uuid::now_v7().simple().to_string(),
                    name: form.username.clone(),
                    username: form.username,
                    department: form.department,
                    year: form.year,
                    college_id: form.college_id,
                    skills: Vec::new(),
                    interests: Vec::new(),
                    bio: String::new(),
                    theme,
                };
                users.push(user.clone());
                Ok(user)
            })
            .await
    }
}

#[derive(Deserialize)]
struct ThemeUpdate {
    theme: Theme,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/me/theme", put(theme))
        .route("/me/profile", put(profile))
}

#[debug_handler(state = AppState)]
async fn register(
    State(sessions): State<SessionManager>,
    session: Session,
    Json(form): Json<Registration>,
) -> AppResult<Json<User>> {
    Ok(Json(sessions.register(&session, form).await?))
}

#[debug_handler(state = AppState)]
async fn login(
    State(sessions): State<SessionManager>,
    session: Session,
    Json(form): Json<Registration>,
) -> AppResult<Json<User>> {
    Ok(Json(sessions.login(&session, form).await?))
}

#[debug_handler(state = AppState)]
async fn logout(
    State(sessions): State<SessionManager>,
    session: Session,
) -> AppResult<()> {
    sessions.logout(&session).await?;
    Ok(())
}

#[debug_handler(state = AppState)]
async fn me(
    State(sessions): State<SessionManager>,
    session: Session,
) -> AppResult<Json<User>> {
    Ok(Json(sessions.require_user(&session).await?))
}

#[debug_handler(state = AppState)]
async fn theme(
    State(sessions): State<SessionManager>,
    session: Session,
    Json(ThemeUpdate { theme }): Json<ThemeUpdate>,
) -> AppResult<Json<User>> {
    let user = sessions.require_user(&session).await?;
    sessions.update_theme(&session, &user.id, theme).await?;
    Ok(Json(sessions.require_user(&session).await?))
}

#[debug_handler(state = AppState)]
async fn profile(
    State(sessions): State<SessionManager>,
    session: Session,
    Json(update): Json<ProfileUpdate>,
) -> AppResult<Json<User>> {
    Ok(Json(sessions.update_profile(&session, update).await?))
}

#[cfg(test)]
pub(crate) fn test_session() -> Session {
    Session::new(None, std::sync::Arc::new(tower_sessions::MemoryStore::default()), None)
}

#[cfg(test)]
pub(crate) fn form(username: &str, department: &str, year: &str, college_id: &str) -> Registration {
    Registration {
        username: username.to_owned(),
        department: department.to_owned(),
        year: year.to_owned(),
        college_id: college_id.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::store::test_store;

    async fn manager(policy: LoginPolicy) -> SessionManager {
        let store = test_store().await;
        SessionManager::new(store.clone(), Directory::new(store), policy)
    }

    #[tokio::test]
    async fn register_then_login_yields_same_user() {
        let sessions = manager(LoginPolicy::CreateMissing).await;
        let registered = sessions.register(&test_session(), form("u1", "CS", "2", "C100")).await.unwrap();

        let session = test_session();
        let logged_in = sessions.login(&session, form("u1", "CS", "2", "C100")).await.unwrap();
        assert_eq!(logged_in.id, registered.id);
        assert_eq!(sessions.require_user(&session).await.unwrap().id, registered.id);
    }

    #[tokio::test]
    async fn register_authenticates_session() {
        let sessions = manager(LoginPolicy::CreateMissing).await;
        let session = test_session();
        assert!(sessions.current_user(&session).await.unwrap().is_none());

        let user = sessions.register(&session, form(" u1 ", "CS", "2", "C100")).await.unwrap();
        assert_eq!(user.username, "u1");
        assert_eq!(user.name, "u1");
        assert!(user.id.starts_with("user"));
        assert!(user.skills.is_empty() && user.interests.is_empty() && user.bio.is_empty());
        assert_eq!(sessions.current_user(&session).await.unwrap(), Some(user));
    }

    #[rstest]
    #[case(form("u1", "EE", "3", "E200"))]
    #[case(form("u2", "EE", "3", "C100"))]
    #[case(form("Alex Johnson", "EE", "3", "E200"))]
    #[case(form("u2", "EE", "3", "CS12345"))]
    #[tokio::test]
    async fn duplicate_identity_leaves_directory_untouched(#[case] clash: Registration) {
        let sessions = manager(LoginPolicy::CreateMissing).await;
        sessions.register(&test_session(), form("u1", "CS", "2", "C100")).await.unwrap();
        let before = sessions.directory.registered().await.unwrap();

        let session = test_session();
        let err = sessions.register(&session, clash).await.unwrap_err();
        assert!(matches!(err, PeerError::DuplicateIdentity));
        assert_eq!(sessions.directory.registered().await.unwrap(), before);
        assert!(sessions.current_user(&session).await.unwrap().is_none());
    }

    #[rstest]
    #[case(form("", "CS", "2", "C100"))]
    #[case(form("u1", "  ", "2", "C100"))]
    #[case(form("u1", "CS", "", "C100"))]
    #[case(form("u1", "CS", "2", "\t"))]
    #[tokio::test]
    async fn blank_fields_are_rejected(#[case] blank: Registration) {
        let sessions = manager(LoginPolicy::CreateMissing).await;
        let err = sessions.register(&test_session(), blank).await.unwrap_err();
        assert!(matches!(err, PeerError::Validation(_)));
    }

    #[tokio::test]
    async fn login_creates_missing_account_by_default() {
        let sessions = manager(LoginPolicy::CreateMissing).await;
        let session = test_session();
        let user = sessions.login(&session, form("new", "Math", "1", "M1")).await.unwrap();
        assert_eq!(sessions.directory.registered().await.unwrap(), vec![user]);
    }

    #[tokio::test]
    async fn strict_login_rejects_unknown_pair() {
        let sessions = manager(LoginPolicy::Strict).await;
        let err = sessions.login(&test_session(), form("new", "Math", "1", "M1")).await.unwrap_err();
        assert!(matches!(err, PeerError::NotFound("user")));
        assert!(sessions.directory.registered().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn login_with_wrong_college_id_cannot_steal_username() {
        let sessions = manager(LoginPolicy::CreateMissing).await;
        sessions.register(&test_session(), form("u1", "CS", "2", "C100")).await.unwrap();
        let err = sessions.login(&test_session(), form("u1", "CS", "2", "C999")).await.unwrap_err();
        assert!(matches!(err, PeerError::DuplicateIdentity));
    }

    #[tokio::test]
    async fn seed_users_can_log_in() {
        let sessions = manager(LoginPolicy::Strict).await;
        let user = sessions.login(&test_session(), form("Sarah Williams", "Design", "Sophomore", "DS67890")).await.unwrap();
        assert_eq!(user.id, "mock2");
    }

    #[tokio::test]
    async fn logout_clears_session() {
        let sessions = manager(LoginPolicy::CreateMissing).await;
        let session = test_session();
        sessions.register(&session, form("u1", "CS", "2", "C100")).await.unwrap();
        sessions.logout(&session).await.unwrap();
        assert!(matches!(sessions.require_user(&session).await, Err(PeerError::Unauthenticated)));
    }

    #[tokio::test]
    async fn theme_updates_record_session_and_global_default() {
        let sessions = manager(LoginPolicy::CreateMissing).await;
        let session = test_session();
        let user = sessions.register(&session, form("u1", "CS", "2", "C100")).await.unwrap();

        sessions.update_theme(&session, &user.id, Theme::Dark).await.unwrap();

        assert_eq!(sessions.require_user(&session).await.unwrap().theme, Theme::Dark);
        assert_eq!(sessions.directory.get(&user.id).await.unwrap().theme, Theme::Dark);
        let next = sessions.register(&test_session(), form("u2", "EE", "3", "E200")).await.unwrap();
        assert_eq!(next.theme, Theme::Dark);
    }

    #[tokio::test]
    async fn profile_update_cleans_tags_and_persists() {
        let sessions = manager(LoginPolicy::CreateMissing).await;
        let session = test_session();
        let user = sessions.register(&session, form("u1", "CS", "2", "C100")).await.unwrap();

        let updated = sessions
            .update_profile(&session, ProfileUpdate {
                name: "Ada Lovelace".to_owned(),
                department: "Math".to_owned(),
                year: "4".to_owned(),
                college_id: "C100".to_owned(),
                bio: "  engines  ".to_owned(),
                skills: parse_tags("Rust, , analysis ,"),
                interests: vec![" looms ".to_owned(), String::new()],
            })
            .await
            .unwrap();

        assert_eq!(updated.id, user.id);
        assert_eq!(updated.username, "u1");
        assert_eq!(updated.bio, "engines");
        assert_eq!(updated.skills, vec!["Rust", "analysis"]);
        assert_eq!(updated.interests, vec!["looms"]);
        assert_eq!(sessions.directory.get(&user.id).await.unwrap(), updated);
        assert_eq!(sessions.require_user(&session).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn profile_update_rejects_taken_college_id() {
        let sessions = manager(LoginPolicy::CreateMissing).await;
        sessions.register(&test_session(), form("u2", "EE", "3", "E200")).await.unwrap();
        let session = test_session();
        sessions.register(&session, form("u1", "CS", "2", "C100")).await.unwrap();

        let err = sessions
            .update_profile(&session, ProfileUpdate {
                name: "u1".to_owned(),
                department: "CS".to_owned(),
                year: "2".to_owned(),
                college_id: "E200".to_owned(),
                bio: String::new(),
                skills: Vec::new(),
                interests: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::DuplicateIdentity));
    }

    fn profile(college_id: &str) -> ProfileUpdate {
        ProfileUpdate {
            name: "Someone".to_owned(),
            department: "CS".to_owned(),
            year: "2".to_owned(),
            college_id: college_id.to_owned(),
            bio: String::new(),
            skills: Vec::new(),
            interests: Vec::new(),
        }
    }

    #[tokio::test]
    async fn concurrent_profile_edits_cannot_share_a_college_id() {
        let sessions = manager(LoginPolicy::CreateMissing).await;
        let mut tasks = Vec::new();
        for i in 0..8 {
            let session = test_session();
            sessions.register(&session, form(&format!("u{i}"), "CS", "2", &format!("C{i}"))).await.unwrap();
            let sessions = sessions.clone();
            tasks.push(tokio::spawn(async move { sessions.update_profile(&session, profile("SHARED")).await }));
        }

        let mut won = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => won += 1,
                Err(err) => assert!(matches!(err, PeerError::DuplicateIdentity)),
            }
        }
        assert_eq!(won, 1);
        let holders = sessions.directory.registered().await.unwrap().into_iter().filter(|u| u.college_id == "SHARED").count();
        assert_eq!(holders, 1);
    }

    #[tokio::test]
    async fn profile_edit_keeps_theme_set_from_another_session() {
        let sessions = manager(LoginPolicy::CreateMissing).await;
        let stale = test_session();
        let user = sessions.register(&stale, form("u1", "CS", "2", "C100")).await.unwrap();

        let fresh = test_session();
        sessions.login(&fresh, form("u1", "CS", "2", "C100")).await.unwrap();
        sessions.update_theme(&fresh, &user.id, Theme::Dark).await.unwrap();

        let updated = sessions.update_profile(&stale, profile("C100")).await.unwrap();
        assert_eq!(updated.theme, Theme::Dark);
        assert_eq!(sessions.directory.get(&user.id).await.unwrap().theme, Theme::Dark);
    }

    #[tokio::test]
    async fn profile_edit_cannot_take_a_seed_college_id() {
        let sessions = manager(LoginPolicy::CreateMissing).await;
        let session = test_session();
        sessions.register(&session, form("u1", "CS", "2", "C100")).await.unwrap();
        let err = sessions.update_profile(&session, profile("CS12345")).await.unwrap_err();
        assert!(matches!(err, PeerError::DuplicateIdentity));
    }

    #[test]
    fn login_policy_parses() {
        assert_eq!("strict".parse::<LoginPolicy>().unwrap(), LoginPolicy::Strict);
        assert_eq!("create-missing".parse::<LoginPolicy>().unwrap(), LoginPolicy::CreateMissing);
        assert!("lenient".parse::<LoginPolicy>().is_err());
    }
}
