pub mod appresult;
pub mod config;
pub mod connections;
pub mod conversations;
pub mod directory;
pub mod error;
pub mod notice;
pub mod projects;
pub mod session;
pub mod store;

use axum::{extract::FromRef, Router};
use tokio::sync::broadcast;

pub use appresult::{AppError, AppResult};
pub use error::{PeerError, PeerResult};

use config::Config;
use connections::ConnectionGraph;
use conversations::ConversationStore;
use directory::Directory;
use projects::ProjectRegistry;
use session::SessionManager;
use store::Store;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Store,
    pub directory: Directory,
    pub sessions: SessionManager,
    pub connections: ConnectionGraph,
    pub conversations: ConversationStore,
    pub projects: ProjectRegistry,
}

impl AppState {
    pub fn new(store: Store, config: &Config) -> AppState {
        let directory = Directory::new(store.clone());
        let (events, _) = broadcast::channel(config.event_capacity);

        AppState {
            sessions: SessionManager::new(store.clone(), directory.clone(), config.login_policy),
            connections: ConnectionGraph::new(store.clone()),
            conversations: ConversationStore::new(store.clone(), events, config.auto_reply_delay)
                .with_demo_seed(config.seed_demo_conversations),
            projects: ProjectRegistry::new(store.clone()),
            directory,
            store,
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/auth", session::router())
        .nest("/peers", directory::router())
        .nest("/connections", connections::router())
        .nest("/conversations", conversations::router())
        .nest("/projects", projects::router())
}
