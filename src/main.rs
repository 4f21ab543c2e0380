// src/main.rs
// Demo: connect, subscribe to the configured binding, publish once, stop on Ctrl-C

use std::sync::Arc;

use anyhow::{Context, Result};
use rabbit_broker::config::{self, RabbitConfig};
use rabbit_broker::env;
use rabbit_broker::rabbitmq::{
    FailurePolicy, HandlerError, Incoming, PublishOptions, RabbitService, SubscriptionSupervisor,
    Target,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
struct Greeting {
    content: String,
    sent_at: chrono::DateTime<chrono::Utc>,
}

fn load_settings() -> Result<RabbitConfig> {
    match env::from_env() {
        Ok(config) => Ok(config),
        Err(e) => {
            warn!(error = %e, "Environment config incomplete, falling back to config file");
            config::load_config().context("no usable RabbitMQ configuration found")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings()?;
    let exchange = Target::exchange(settings.exchange.clone());
    let exchange_type = settings.exchange_type;
    let routing_key = settings.routing_key.clone();
    let auto_ack = settings.auto_ack;

    let service = Arc::new(
        RabbitService::connect(settings)
            .await
            .context("failed to start RabbitMQ service")?,
    );

    let mut supervisor = SubscriptionSupervisor::new(FailurePolicy::Isolate);
    let stream = service
        .subscribe(supervisor.token(), &exchange, exchange_type, &routing_key)
        .await
        .context("failed to subscribe")?;
    supervisor.spawn("events", stream, auto_ack, |msg: Incoming| async move {
        info!(
            routing_key = %msg.routing_key,
            body = %String::from_utf8_lossy(&msg.body),
            "Received message"
        );
        Ok::<(), HandlerError>(())
    });

    // Only a concrete key can be published to; wildcard bindings get a sample key.
    let publish_key = routing_key.replace(['*', '#'], "demo");
    let correlation_id = service
        .publish_json(
            &exchange,
            &publish_key,
            &Greeting {
                content: "hello from rabbit-broker".to_string(),
                sent_at: chrono::Utc::now(),
            },
            PublishOptions::default(),
        )
        .await
        .context("failed to publish sample message")?;
    info!(correlation_id = %correlation_id, "Sample message published, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down");

    supervisor.shutdown();
    for outcome in supervisor.join().await {
        match outcome.result {
            Ok(handled) => info!(subscription = %outcome.name, handled, "Subscription stopped"),
            Err(e) => warn!(subscription = %outcome.name, error = %e, "Subscription failed"),
        }
    }

    service.close().await.context("failed to close RabbitMQ service")?;
    Ok(())
}
