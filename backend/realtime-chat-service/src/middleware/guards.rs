//! Request extractors that enforce authentication at the type level

use std::future::{ready, Ready};

use actix_web::{web, Error, FromRequest, HttpRequest};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::auth::extract_token;
use crate::state::AppState;

/// Represents an authenticated user extracted from the bearer credential
#[derive(Debug, Clone, Copy)]
pub struct User {
    pub id: Uuid,
}

impl FromRequest for User {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        ready(authenticate(req).map_err(Error::from))
    }
}

fn authenticate(req: &HttpRequest) -> Result<User, AppError> {
    let state = req
        .app_data::<web::Data<AppState>>()
        .ok_or(AppError::Internal)?;

    let authorization = req
        .headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let token = extract_token(authorization, None).ok_or(AppError::Unauthorized)?;
    let id = state.auth.authenticate(&token)?;
    Ok(User { id })
}
