use actix_web::{web, App, HttpServer};
use anyhow::Context;
use realtime_chat_service::{config, logging, routes, state::AppState};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Arc::new(config::Config::from_env()?);
    logging::init_tracing(cfg.log_format);

    let state = AppState::from_config(cfg.clone()).await?;

    let ws_addr = format!("0.0.0.0:{}", cfg.ws_port);
    let ws_listener = TcpListener::bind(&ws_addr)
        .await
        .with_context(|| format!("bind websocket listener on {ws_addr}"))?;

    let http_addr = format!("0.0.0.0:{}", cfg.http_port);
    tracing::info!(%ws_addr, %http_addr, "starting realtime-chat-service");

    // actix-web server futures are not Send, so the HTTP server runs in the
    // foreground while the WebSocket listener is spawned.
    let ws_task = tokio::spawn(routes::wsroute::serve(ws_listener, state.clone()));

    let http_state = state.clone();
    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(http_state.clone()))
            .configure(routes::configure)
    })
    .bind(&http_addr)
    .with_context(|| format!("bind http server on {http_addr}"))?
    .run();

    tokio::select! {
        res = http_server => {
            res.context("http server")?;
        }
        res = ws_task => {
            res.context("websocket listener task")?
                .context("websocket listener")?;
        }
    }

    tracing::info!("realtime-chat-service stopped");
    Ok(())
}
