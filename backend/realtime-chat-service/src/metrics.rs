use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

/// Messages handed to the router, labelled by outcome (`live` or `queued`).
pub static MESSAGES_ROUTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_chat_messages_routed_total",
            "Envelopes routed by realtime-chat-service",
        ),
        &["outcome"],
    )
    .expect("failed to create realtime_chat_messages_routed_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register realtime_chat_messages_routed_total");
    counter
});

pub static FANOUT_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "realtime_chat_fanout_failures_total",
        "Deliveries to a connection handle whose channel was already closed",
    )
    .expect("failed to create realtime_chat_fanout_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register realtime_chat_fanout_failures_total");
    counter
});

pub static OFFLINE_EXPIRED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "realtime_chat_offline_expired_total",
        "Queued envelopes dropped at drain time because retention elapsed",
    )
    .expect("failed to create realtime_chat_offline_expired_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register realtime_chat_offline_expired_total");
    counter
});

/// Accepted delivery-state transitions, labelled by new state.
pub static RECEIPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_chat_receipts_total",
            "Accepted delivery state transitions",
        ),
        &["status"],
    )
    .expect("failed to create realtime_chat_receipts_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register realtime_chat_receipts_total");
    counter
});

pub static OPEN_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "realtime_chat_open_connections",
        "Authenticated WebSocket connections currently open",
    )
    .expect("failed to create realtime_chat_open_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register realtime_chat_open_connections");
    gauge
});

pub static ONLINE_USERS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "realtime_chat_online_users",
        "Users with at least one open connection",
    )
    .expect("failed to create realtime_chat_online_users");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register realtime_chat_online_users");
    gauge
});

pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
