use serde_json::json;

use session_core::ipc::{SessionRequest, SessionResponse};
use session_core::models::state::base64_state;
use session_core::models::{GetOptions, Session, SessionKey, StateMap};
use session_core::Result;

use crate::service::SessionService;

pub async fn handle_request(request: SessionRequest, service: &SessionService) -> SessionResponse {
    if matches!(request, SessionRequest::Ping) {
        return SessionResponse::pong();
    }
    match dispatch(request, service).await {
        Ok(data) => SessionResponse::ok(data),
        Err(e) => SessionResponse::err(e.to_string()),
    }
}

async fn dispatch(request: SessionRequest, service: &SessionService) -> Result<serde_json::Value> {
    match request {
        SessionRequest::Ping => Ok(SessionResponse::pong().data.unwrap_or_default()),
        SessionRequest::Health => {
            let version = session_core::db::health_check(service.pool()).await?;
            Ok(json!({
                "mysql": version,
                "closed": service.is_closed(),
                "status": "healthy"
            }))
        }
        SessionRequest::CreateSession { key, state } => {
            let session = service.create_session(key, &state).await?;
            to_value(&session)
        }
        SessionRequest::GetSession { key, options } => {
            let session = service.get_session(&key, &options).await?;
            to_value(&session)
        }
        SessionRequest::ListSessions { key, options } => {
            let sessions = service.list_sessions(&key, &options).await?;
            to_value(&sessions)
        }
        SessionRequest::DeleteSession { key } => {
            service.delete_session(&key).await?;
            Ok(json!({"deleted": true}))
        }
        SessionRequest::UpdateSessionState { key, state } => {
            service.update_session_state(&key, &state).await?;
            Ok(json!({"updated": true}))
        }
        SessionRequest::UpdateAppState { app_name, state } => {
            service.update_app_state(&app_name, &state).await?;
            Ok(json!({"updated": true}))
        }
        SessionRequest::ListAppStates { app_name } => {
            let state = service.list_app_states(&app_name).await?;
            Ok(json!({"state": encode_state(&state)?}))
        }
        SessionRequest::DeleteAppState { app_name, key } => {
            service.delete_app_state(&app_name, &key).await?;
            Ok(json!({"deleted": true}))
        }
        SessionRequest::UpdateUserState { key, state } => {
            service.update_user_state(&key, &state).await?;
            Ok(json!({"updated": true}))
        }
        SessionRequest::ListUserStates { key } => {
            let state = service.list_user_states(&key).await?;
            Ok(json!({"state": encode_state(&state)?}))
        }
        SessionRequest::DeleteUserState { key, state_key } => {
            service.delete_user_state(&key, &state_key).await?;
            Ok(json!({"deleted": true}))
        }
        SessionRequest::AppendEvent { key, event } => {
            let mut session = load(service, &key).await?;
            let event_id = event.id.clone();
            service.append_event(&mut session, event).await?;
            Ok(json!({"appended": true, "id": event_id, "events": session.events.len()}))
        }
        SessionRequest::AppendTrackEvent { key, event } => {
            let mut session = load(service, &key).await?;
            let track = event.track.clone();
            service.append_track_event(&mut session, event).await?;
            Ok(json!({"appended": true, "track": track}))
        }
        SessionRequest::GetSummaryText { key, filter_key } => {
            let session = load(service, &key).await?;
            let text = service.get_session_summary_text(&session, &filter_key).await?;
            Ok(json!({"summary": text}))
        }
    }
}

/// Fetch a live session for requests that operate on one.
async fn load(service: &SessionService, key: &SessionKey) -> Result<Session> {
    service
        .get_session(key, &GetOptions::default())
        .await?
        .ok_or(session_core::SessionError::SessionNotFound)
}

fn encode_state(state: &StateMap) -> Result<serde_json::Value> {
    base64_state::serialize(state, serde_json::value::Serializer)
        .map_err(|e| session_core::SessionError::serde("encode state", e))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| session_core::SessionError::serde("encode response", e))
}
