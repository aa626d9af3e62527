pub mod chat;
pub mod conversations;
pub mod events;
pub mod health;
pub mod sessions;
pub mod voice;

use axum::Router;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/chat", chat::router())
        .nest("/conversations", conversations::router())
        .nest("/events", events::router())
        .nest("/health", health::router())
        .nest("/sessions", sessions::router())
        .nest("/voice", voice::router())
}
