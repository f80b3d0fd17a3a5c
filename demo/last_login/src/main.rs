mod config;
use config::LastLoginConfig;
use courier_core::telemetry::init_tracing;
use courier_core::{Envelope, MessageBus, PromiseConfig, RequestDispatcher, RequestOptions};
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging / tracing
    init_tracing("info,courier_core=info,last_login=info");

    let cfg = LastLoginConfig::load();
    info!(target = "last_login", ?cfg, "Starting last-login request/reply demo");

    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::with_config(
        bus.clone(),
        PromiseConfig::tokio(),
        cfg.request_reply.clone(),
    );

    // Responder side: answer last-login lookups on the configured topic
    let (_sub_id, mut requests) = bus.subscribe(cfg.channel.clone(), cfg.topic.clone());
    let delay = Duration::from_millis(cfg.responder_delay_ms);
    let responder = tokio::spawn(async move {
        while let Some(req) = requests.recv().await {
            tokio::spawn(answer_last_login(req, delay));
        }
    });

    // Requester side
    let reply = dispatcher
        .request(
            RequestOptions::new(cfg.topic.clone())
                .channel(cfg.channel.clone())
                .data(json!({ "userId": cfg.user_id }))
                .timeout(Duration::from_millis(cfg.request_timeout_ms)),
        )?
        .await;

    match reply {
        Ok(data) => info!(
            target = "last_login",
            user_id = %data["userId"],
            time = %data["time"],
            "Received response"
        ),
        Err(err) if err.is_timeout() => warn!(target = "last_login", error = %err, "No response in time"),
        Err(err) => error!(target = "last_login", error = %err, "Request failed"),
    }

    responder.abort();
    Ok(())
}

async fn answer_last_login(req: Envelope, delay: Duration) {
    info!(
        target = "last_login",
        user_id = %req.data["userId"],
        "Received request"
    );
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let result = match req.data.get("userId") {
        Some(user_id) => req.reply(None, json!({ "time": req.timestamp_ms, "userId": user_id })),
        None => req.reply(Some(json!({ "msg": "userId is required" })), json!(null)),
    };
    if let Err(e) = result {
        warn!(target = "last_login", error = %e, "Failed to publish reply");
    }
}
