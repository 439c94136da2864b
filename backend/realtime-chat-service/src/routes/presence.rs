use crate::{error::AppError, middleware::guards::User, state::AppState, websocket::PresenceRecord};
use actix_web::{get, web, HttpResponse};
use uuid::Uuid;

/// GET /presence/{user_id}
/// Current online state and last-seen time; users never seen report offline
#[get("/presence/{user_id}")]
pub async fn get_presence(
    state: web::Data<AppState>,
    user_id: web::Path<Uuid>,
    _user: User,
) -> Result<HttpResponse, AppError> {
    let user_id = user_id.into_inner();
    let record = state.presence.record(user_id).unwrap_or(PresenceRecord {
        user_id,
        open_handles: 0,
        is_online: false,
        last_seen: None,
    });
    Ok(HttpResponse::Ok().json(record))
}
