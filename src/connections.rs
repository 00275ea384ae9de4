use std::collections::HashMap;

use axum::{debug_handler, extract::{Path, State}, routing::{delete, get, post}, Json, Router};
use serde::Serialize;
use tower_sessions::Session;

use crate::{directory::{Directory, User}, notice::Notice, session::SessionManager, store::{Key, Store}, AppResult, AppState, PeerError, PeerResult};

/// Viewer id to the peers that viewer has connected with, in connection order.
/// Not symmetric: each side keeps its own list.
pub type Graph = HashMap<String, Vec<String>>;

#[derive(Clone)]
pub struct ConnectionGraph {
    store: Store,
}

impl ConnectionGraph {
    pub fn new(store: Store) -> ConnectionGraph {
        ConnectionGraph { store }
    }

    /// Connects if absent, disconnects if present. Returns whether `peer` is connected afterwards.
    pub async fn toggle(&self, viewer: &str, peer: &str) -> PeerResult<bool> {
        if viewer == peer {
            return Err(PeerError::Validation("You cannot connect with yourself"));
        }

        let connected = self
            .store
            .update(Key::Connections, |graph: &mut Graph| {
                let peers = graph.entry(viewer.to_owned()).or_default();
                if let Some(pos) = peers.iter().position(|p| p == peer) {
                    peers.remove(pos);
                    Ok(false)
                } else {
                    peers.push(peer.to_owned());
                    Ok(true)
                }
            })
            .await?;

        tracing::debug!("{viewer} -> {peer}: connected={connected}");
        Ok(connected)
    }

    /// Returns whether anything was removed.
    pub async fn remove(&self, viewer: &str, peer: &str) -> PeerResult<bool> {
        self.store
            .update(Key::Connections, |graph: &mut Graph| {
                let Some(peers) = graph.get_mut(viewer) else {
                    return Ok(false);
                };
                let before = peers.len();
                peers.retain(|p| p != peer);
                Ok(peers.len() != before)
            })
            .await
    }

    pub async fn is_connected(&self, viewer: &str, peer: &str) -> PeerResult<bool> {
        Ok(self.peers(viewer).await?.iter().any(|p| p == peer))
    }

    pub async fn peers(&self, viewer: &str) -> PeerResult<Vec<String>> {
        let mut graph: Graph = self.store.load(Key::Connections).await?;
        Ok(graph.remove(viewer).unwrap_or_default())
    }

    /// Connected peers as users; ids the directory does not know are skipped.
    pub async fn connected_users(&self, viewer: &str, directory: &Directory) -> PeerResult<Vec<User>> {
        let all = directory.list_all().await?;
        Ok(self
            .peers(viewer)
            .await?
            .iter()
            .filter_map(|id| all.iter().find(|u| &u.id == id).cloned())
            .collect())
    }
}

#[derive(Serialize)]
struct ToggleOutcome {
    connected: bool,
    notice: Notice,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/{peer_id}/toggle", post(toggle))
        .route("/{peer_id}", delete(remove))
}

#[debug_handler(state = AppState)]
async fn list(
    State(sessions): State<SessionManager>,
    State(directory): State<Directory>,
    State(connections): State<ConnectionGraph>,
    session: Session,
) -> AppResult<Json<Vec<User>>> {
    let viewer = sessions.require_user(&session).await?;
    Ok(Json(connections.connected_users(&viewer.id, &directory).await?))
}

#[debug_handler(state = AppState)]
async fn toggle(
    State(sessions): State<SessionManager>,
    State(directory): State<Directory>,
    State(connections): State<ConnectionGraph>,
    Path(peer_id): Path<String>,
    session: Session,
) -> AppResult<Json<ToggleOutcome>> {
    let viewer = sessions.require_user(&session).await?;
    directory.get(&peer_id).await?;

    let connected = connections.toggle(&viewer.id, &peer_id).await?;
    let notice = if connected {
        Notice::success("Success", "Connection added")
    } else {
        Notice::success("Success", "Connection removed")
    };
    Ok(Json(ToggleOutcome { connected, notice }))
}

#[debug_handler(state = AppState)]
async fn remove(
    State(sessions): State<SessionManager>,
    State(connections): State<ConnectionGraph>,
    Path(peer_id): Path<String>,
    session: Session,
) -> AppResult<Json<Notice>> {
    let viewer = sessions.require_user(&session).await?;
    if !connections.remove(&viewer.id, &peer_id).await? {
        return Err(PeerError::NotFound("connection").into());
    }
    Ok(Json(Notice::success("Connection Removed", "You're no longer connected with this student")))
}
