//! WebSocket listener: authenticates the upgrade, then hands the stream to a
//! per-connection task.

use crate::middleware::auth::extract_token;
use crate::state::AppState;
use crate::websocket::session;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use uuid::Uuid;

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "websocket listener started");
    }

    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, state).await;
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: AppState) {
    let mut user_id: Option<Uuid> = None;

    let auth = state.auth.clone();
    let callback = |req: &Request, resp: Response| {
        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let authenticated = extract_token(authorization, req.uri().query())
            .and_then(|token| auth.authenticate(&token).ok());

        match authenticated {
            Some(id) => {
                user_id = Some(id);
                Ok(resp)
            }
            None => Err(unauthorized()),
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "websocket handshake rejected");
            return;
        }
    };

    let Some(user_id) = user_id else {
        return;
    };

    tracing::debug!(%peer, user_id = %user_id, "websocket upgraded");
    session::serve(ws, state, user_id).await;
}

fn unauthorized() -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some("unauthorized".to_string()));
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp
}
