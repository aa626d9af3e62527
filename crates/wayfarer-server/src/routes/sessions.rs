use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub voice_sessions: usize,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(session_stats))
}

async fn session_stats(State(state): State<AppState>) -> Json<SessionStats> {
    Json(SessionStats {
        active_sessions: state.gateway.orchestrator().sessions().active_count(),
        voice_sessions: state.gateway.active_voice_sessions(),
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use wayfarer_schema::{Channel, InboundMessage};

    use super::*;
    use crate::state::test_state;

    #[tokio::test]
    async fn counts_live_sessions() {
        let (state, _tmp) = test_state(|_| {});
        for user in ["ana", "ben"] {
            state
                .gateway
                .handle_chat(InboundMessage::new(user, Channel::Chat, "hi"))
                .await
                .unwrap();
        }

        let resp = router()
            .with_state(state)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["active_sessions"], 2);
        assert_eq!(body["voice_sessions"], 0);
    }
}
