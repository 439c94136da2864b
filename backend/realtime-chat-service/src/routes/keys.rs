use crate::{error::AppError, middleware::guards::User, state::AppState};
use actix_web::{get, post, web, HttpResponse};
use crypto_core::PublishKeysRequest;
use serde::Serialize;
use uuid::Uuid;

#[derive(Serialize)]
pub struct OneTimeKeyCount {
    pub user_id: Uuid,
    pub remaining: usize,
}

/// GET /keys/{user_id}/bundle
/// Issues the user's prekey bundle, claiming at most one one-time prekey
#[get("/keys/{user_id}/bundle")]
pub async fn get_bundle(
    state: web::Data<AppState>,
    user_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let user_id = user_id.into_inner();
    let bundle = state
        .keys
        .fetch_bundle(user_id)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(HttpResponse::Ok().json(bundle))
}

/// POST /keys
/// Publish the caller's identity key, signed prekey and a batch of one-time prekeys
#[post("/keys")]
pub async fn publish_keys(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<PublishKeysRequest>,
) -> Result<HttpResponse, AppError> {
    let request = body.into_inner();
    let published = request.one_time_pre_keys.len();
    state.keys.publish(user.id, request).await?;

    tracing::info!(user_id = %user.id, published, "keys published");
    Ok(HttpResponse::NoContent().finish())
}

/// GET /keys/{user_id}/count
#[get("/keys/{user_id}/count")]
pub async fn one_time_key_count(
    state: web::Data<AppState>,
    user_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let user_id = user_id.into_inner();
    let remaining = state.keys.one_time_key_count(user_id).await?;
    Ok(HttpResponse::Ok().json(OneTimeKeyCount { user_id, remaining }))
}
