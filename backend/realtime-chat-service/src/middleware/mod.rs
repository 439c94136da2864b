pub mod auth;
pub mod guards;

pub use auth::{Authenticator, JwtAuthenticator};
