use std::sync::Arc;
use std::time::Duration;

use rabbit_broker::config::RabbitConfig;
use rabbit_broker::rabbitmq::{
    Acknowledge, ExchangeType, HandlerError, Incoming, PublishOptions, RabbitMQError, RabbitService,
    RetryPolicy, Target, TopologyDescriptor,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::mock::{MockBroker, MockConnection, Settlement};

const WAIT: Duration = Duration::from_secs(1);

fn orders_config() -> RabbitConfig {
    RabbitConfig {
        queue: "orders.created".to_string(),
        exchange: "orders".to_string(),
        exchange_type: ExchangeType::Topic,
        routing_key: "created.*".to_string(),
        ..RabbitConfig::default()
    }
}

async fn start(broker: &MockBroker) -> RabbitService<MockConnection> {
    RabbitService::from_connection(broker.connection(), orders_config())
        .await
        .expect("service should start against the mock broker")
}

#[tokio::test]
async fn startup_declares_topology_then_enables_confirms() {
    let broker = MockBroker::new();
    let service = start(&broker).await;

    assert_eq!(
        broker.calls(),
        vec![
            "open_channel",
            "exchange_declare",
            "queue_declare",
            "queue_bind",
            "basic_qos",
            "confirm_select"
        ]
    );
    assert_eq!(broker.exchange_kind("orders"), Some(ExchangeType::Topic));
    assert_eq!(
        broker.bindings_for("orders"),
        vec![("orders.created".to_string(), "created.*".to_string())]
    );
    assert_eq!(broker.prefetch(), Some(10));
    assert!(broker.confirms_enabled());
    assert!(service.is_open().await);
}

#[tokio::test]
async fn invalid_config_only_closes_the_given_connection() {
    let broker = MockBroker::new();
    let config = RabbitConfig {
        routing_key: String::new(),
        ..orders_config()
    };

    let result = RabbitService::from_connection(broker.connection(), config).await;
    assert!(matches!(result, Err(RabbitMQError::ConfigError(_))));
    // The connection handed in is still closed, nothing else is touched.
    assert_eq!(broker.calls(), vec!["connection.close"]);
}

#[tokio::test]
async fn declaring_the_same_topology_twice_is_harmless() {
    let broker = MockBroker::new();
    let service = start(&broker).await;
    let descriptor = service.config().topology();

    service.declare_topology(&descriptor).await.unwrap();
    service.declare_topology(&descriptor).await.unwrap();

    assert_eq!(broker.bindings_for("orders").len(), 1);
}

#[tokio::test]
async fn conflicting_exchange_kind_is_a_topology_error() {
    let broker = MockBroker::new();
    let service = start(&broker).await;
    let descriptor = TopologyDescriptor::new("orders", "direct", "orders.audit", "audit").unwrap();

    match service.declare_topology(&descriptor).await {
        Err(RabbitMQError::TopologyError(msg)) => {
            assert!(msg.contains("failed to declare exchange 'orders'"), "{msg}")
        }
        other => panic!("expected topology error, got {other:?}"),
    }
    assert_eq!(broker.exchange_kind("orders"), Some(ExchangeType::Topic));

    // The broker closed the channel; the service reopens it and keeps working.
    assert_eq!(broker.count("open_channel"), 2);
    let orders = Target::exchange("orders");
    let mut stream = service
        .subscribe(CancellationToken::new(), &orders, ExchangeType::Topic, "created.*")
        .await
        .unwrap();
    service.publish(&orders, "created.us", b"after conflict").await.unwrap();

    let delivery = timeout(WAIT, stream.recv()).await.unwrap().unwrap();
    assert_eq!(delivery.body(), b"after conflict");
}

#[tokio::test]
async fn failed_subscribe_setup_leaves_service_usable() {
    for op in ["queue_declare", "queue_bind", "basic_consume"] {
        let broker = MockBroker::new();
        let service = start(&broker).await;
        broker.fail_on(op);

        let result = service
            .subscribe(
                CancellationToken::new(),
                &Target::exchange("orders"),
                ExchangeType::Topic,
                "created.*",
            )
            .await;
        assert!(
            matches!(result, Err(RabbitMQError::SubscribeError(_))),
            "{op} failure should be a subscribe error"
        );

        service
            .publish(&Target::exchange("orders"), "created.us", b"still up")
            .await
            .unwrap_or_else(|e| panic!("publish after {op} failure: {e}"));
        assert!(service.is_open().await);
    }
}

#[tokio::test]
async fn failed_consume_is_reported_with_queue_name() {
    let broker = MockBroker::new();
    let service = start(&broker).await;
    broker.fail_on("basic_consume");

    match service
        .subscribe(CancellationToken::new(), &Target::queue("jobs"), ExchangeType::Direct, "")
        .await
    {
        Err(RabbitMQError::SubscribeError(msg)) => {
            assert!(msg.starts_with("failed to consume messages from 'jobs'"), "{msg}")
        }
        Err(other) => panic!("expected subscribe error, got {other:?}"),
        Ok(_) => panic!("expected subscribe error, got a stream"),
    }
}

#[tokio::test]
async fn topic_subscription_receives_matching_message() {
    let broker = MockBroker::new();
    let service = start(&broker).await;
    let orders = Target::exchange("orders");

    let mut stream = service
        .subscribe(CancellationToken::new(), &orders, ExchangeType::Topic, "created.*")
        .await
        .unwrap();
    assert_eq!(stream.queue(), "orders.created");

    service.publish(&orders, "created.us", b"hello").await.unwrap();

    let delivery = timeout(WAIT, stream.recv()).await.unwrap().unwrap();
    assert_eq!(delivery.body(), b"hello");
    assert_eq!(delivery.routing_key(), "created.us");

    let published = broker.published();
    assert_eq!(published[0].exchange, "orders");
    assert_eq!(
        published[0].properties.content_type().as_ref().map(|c| c.as_str()),
        Some("text/plain")
    );
}

#[tokio::test]
async fn non_matching_routing_key_is_not_delivered() {
    let broker = MockBroker::new();
    let service = start(&broker).await;
    let orders = Target::exchange("orders");

    let mut stream = service
        .subscribe(CancellationToken::new(), &orders, ExchangeType::Topic, "created.*")
        .await
        .unwrap();

    service.publish(&orders, "updated.us", b"ignored").await.unwrap();
    service.publish(&orders, "created.eu", b"wanted").await.unwrap();

    let delivery = timeout(WAIT, stream.recv()).await.unwrap().unwrap();
    assert_eq!(delivery.body(), b"wanted");
}

#[tokio::test]
async fn queue_target_uses_default_exchange() {
    let broker = MockBroker::new();
    let service = start(&broker).await;
    let jobs = Target::queue("jobs");

    let mut stream = service
        .subscribe(CancellationToken::new(), &jobs, ExchangeType::Direct, "unused")
        .await
        .unwrap();
    assert_eq!(stream.queue(), "jobs");

    service.publish(&jobs, "ignored", b"work").await.unwrap();

    let delivery = timeout(WAIT, stream.recv()).await.unwrap().unwrap();
    assert_eq!(delivery.body(), b"work");

    let published = broker.published();
    assert_eq!(published[0].exchange, "");
    assert_eq!(published[0].routing_key, "jobs");
    // Queue subscriptions declare no exchange and add no binding.
    assert_eq!(broker.count("exchange_declare"), 1);
}

#[tokio::test]
async fn concurrent_publishes_arrive_intact() {
    let broker = MockBroker::new();
    let service = Arc::new(start(&broker).await);
    let orders = Target::exchange("orders");

    let mut stream = service
        .subscribe(CancellationToken::new(), &orders, ExchangeType::Topic, "created.*")
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let service = service.clone();
        let target = orders.clone();
        handles.push(tokio::spawn(async move {
            let body = format!("order-{i:02}");
            service.publish(&target, "created.us", body.as_bytes()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..20 {
        let delivery = timeout(WAIT, stream.recv()).await.unwrap().unwrap();
        received.push(String::from_utf8(delivery.body().to_vec()).unwrap());
    }
    received.sort();

    let expected: Vec<String> = (0..20).map(|i| format!("order-{i:02}")).collect();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn cancelling_a_subscription_ends_its_stream() {
    let broker = MockBroker::new();
    let service = start(&broker).await;
    let orders = Target::exchange("orders");
    let cancel = CancellationToken::new();

    let mut stream = service
        .subscribe(cancel.clone(), &orders, ExchangeType::Topic, "created.*")
        .await
        .unwrap();

    cancel.cancel();
    service.publish(&orders, "created.us", b"late").await.unwrap();

    assert!(timeout(WAIT, stream.recv()).await.unwrap().is_none());
    assert!(stream.is_cancelled());
    // The service itself is unaffected.
    assert!(service.is_open().await);
}

#[tokio::test]
async fn closing_the_service_ends_live_streams() {
    let broker = MockBroker::new();
    let service = start(&broker).await;

    let mut stream = service
        .subscribe(
            CancellationToken::new(),
            &Target::exchange("orders"),
            ExchangeType::Topic,
            "created.*",
        )
        .await
        .unwrap();

    service.close().await.unwrap();
    assert!(timeout(WAIT, stream.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn operations_after_close_fail_without_broker_calls() {
    let broker = MockBroker::new();
    let service = start(&broker).await;
    service.close().await.unwrap();
    assert!(!service.is_open().await);

    let calls_after_close = broker.calls().len();
    let orders = Target::exchange("orders");

    assert!(matches!(
        service.publish(&orders, "created.us", b"x").await,
        Err(RabbitMQError::NotInitialized)
    ));
    assert!(matches!(
        service
            .subscribe(CancellationToken::new(), &orders, ExchangeType::Topic, "created.*")
            .await,
        Err(RabbitMQError::NotInitialized)
    ));
    assert!(matches!(
        service.declare_topology(&service.config().topology()).await,
        Err(RabbitMQError::NotInitialized)
    ));
    assert!(matches!(service.close().await, Err(RabbitMQError::NotInitialized)));

    assert_eq!(broker.calls().len(), calls_after_close);
}

#[tokio::test]
async fn failed_queue_declare_releases_channel_then_connection() {
    let broker = MockBroker::new();
    broker.fail_on("queue_declare");

    let result = RabbitService::from_connection(broker.connection(), orders_config()).await;
    match result {
        Err(RabbitMQError::TopologyError(msg)) => assert!(msg.contains("orders.created"), "{msg}"),
        Err(other) => panic!("expected topology error, got {other:?}"),
        Ok(_) => panic!("expected topology error, got a running service"),
    }

    let calls = broker.calls();
    assert_eq!(&calls[calls.len() - 2..], ["channel.close", "connection.close"]);
    assert_eq!(broker.count("queue_bind"), 0);
}

#[tokio::test]
async fn failed_channel_open_releases_connection() {
    let broker = MockBroker::new();
    broker.fail_on("open_channel");

    let result = RabbitService::from_connection(broker.connection(), orders_config()).await;
    assert!(matches!(result, Err(RabbitMQError::ConnectionError(_))));
    assert_eq!(broker.calls(), vec!["open_channel", "connection.close"]);
}

#[tokio::test]
async fn failed_confirm_mode_is_a_connection_error() {
    let broker = MockBroker::new();
    broker.fail_on("confirm_select");

    let result = RabbitService::from_connection(broker.connection(), orders_config()).await;
    assert!(matches!(result, Err(RabbitMQError::ConnectionError(_))));
    assert_eq!(broker.count("channel.close"), 1);
    assert_eq!(broker.count("connection.close"), 1);
}

#[tokio::test]
async fn close_reports_both_failures() {
    let broker = MockBroker::new();
    let service = start(&broker).await;
    broker.fail_on("channel.close");
    broker.fail_on("connection.close");

    match service.close().await {
        Err(RabbitMQError::CloseError(errors)) => {
            assert_eq!(errors.len(), 2);
            assert!(errors[0].starts_with("failed to close channel"));
            assert!(errors[1].starts_with("failed to close connection"));
        }
        other => panic!("expected close error, got {other:?}"),
    }
    assert_eq!(broker.count("connection.close"), 1);
    assert!(!service.is_open().await);
}

#[tokio::test]
async fn broker_nack_is_a_publish_error() {
    let broker = MockBroker::new();
    let service = start(&broker).await;
    broker.nack_publishes();

    match service.publish(&Target::exchange("orders"), "created.us", b"x").await {
        Err(RabbitMQError::PublishError(msg)) => assert!(msg.contains("not acknowledged"), "{msg}"),
        other => panic!("expected publish error, got {other:?}"),
    }
}

#[tokio::test]
async fn publishing_to_unknown_exchange_fails() {
    let broker = MockBroker::new();
    let service = start(&broker).await;

    let result = service.publish(&Target::exchange("missing"), "k", b"x").await;
    assert!(matches!(result, Err(RabbitMQError::PublishError(_))));

    service
        .publish(&Target::exchange("orders"), "created.us", b"x")
        .await
        .unwrap();
}

#[tokio::test]
async fn publish_json_sets_message_properties() {
    let broker = MockBroker::new();
    let service = start(&broker).await;

    let generated = service
        .publish_json(
            &Target::exchange("orders"),
            "created.us",
            &serde_json::json!({ "order_id": "42" }),
            PublishOptions::default(),
        )
        .await
        .unwrap();
    assert!(!generated.is_empty());

    let supplied = service
        .publish_json(
            &Target::exchange("orders"),
            "created.us",
            &serde_json::json!({ "order_id": "43" }),
            PublishOptions {
                reply_to: Some("orders.replies".to_string()),
                correlation_id: Some("req-1".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(supplied, "req-1");

    let published = broker.published();
    let first = &published[0].properties;
    assert_eq!(
        first.content_type().as_ref().map(|c| c.as_str()),
        Some("application/json")
    );
    assert_eq!(
        first.correlation_id().as_ref().map(|c| c.as_str()),
        Some(generated.as_str())
    );
    assert!(first.message_id().is_some());
    assert!(first.timestamp().is_some());

    let second = &published[1].properties;
    assert_eq!(second.reply_to().as_ref().map(|r| r.as_str()), Some("orders.replies"));

    let body: serde_json::Value = serde_json::from_slice(&published[1].body).unwrap();
    assert_eq!(body["order_id"], "43");
}

#[tokio::test]
async fn publish_with_retry_gives_up_after_max_attempts() {
    let broker = MockBroker::new();
    let service = start(&broker).await;
    broker.nack_publishes();

    let policy = RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    };
    let result = service
        .publish_with_retry(
            &Target::exchange("orders"),
            "created.us",
            b"x",
            &policy,
            &CancellationToken::new(),
        )
        .await;

    match result {
        Err(RabbitMQError::PublishError(msg)) => assert!(msg.starts_with("max retries reached"), "{msg}"),
        other => panic!("expected publish error, got {other:?}"),
    }
    assert_eq!(broker.count("basic_publish"), 3);
}

#[tokio::test]
async fn publish_with_retry_does_not_retry_a_closed_service() {
    let broker = MockBroker::new();
    let service = start(&broker).await;
    service.close().await.unwrap();

    let result = service
        .publish_with_retry(
            &Target::exchange("orders"),
            "created.us",
            b"x",
            &RetryPolicy::default(),
            &CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(RabbitMQError::NotInitialized)));
    assert_eq!(broker.count("basic_publish"), 0);
}

#[tokio::test]
async fn publish_with_retry_stops_when_cancelled() {
    let broker = MockBroker::new();
    let service = start(&broker).await;
    broker.nack_publishes();

    let cancel = CancellationToken::new();
    let policy = RetryPolicy {
        max_attempts: 10,
        initial_delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(30),
    };

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        stopper.cancel();
    });

    let result = timeout(
        WAIT,
        service.publish_with_retry(&Target::exchange("orders"), "created.us", b"x", &policy, &cancel),
    )
    .await
    .expect("cancel should interrupt the backoff");
    assert!(matches!(result, Err(RabbitMQError::PublishError(_))));
    assert_eq!(broker.count("basic_publish"), 1);
}

#[tokio::test]
async fn consume_acks_handled_messages_and_requeues_failures() {
    let broker = MockBroker::new();
    let service = Arc::new(start(&broker).await);
    let orders = Target::exchange("orders");
    let cancel = CancellationToken::new();

    let consumer = {
        let service = service.clone();
        let cancel = cancel.clone();
        let orders = orders.clone();
        tokio::spawn(async move {
            service
                .consume(cancel, &orders, ExchangeType::Topic, "created.*", |msg: Incoming| async move {
                    match msg.text() {
                        Some("poison") => Err::<(), HandlerError>("cannot process".into()),
                        _ => Ok(()),
                    }
                })
                .await
        })
    };

    // Wait for the consumer to attach before publishing.
    timeout(WAIT, async {
        while broker.count("basic_consume") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    service.publish(&orders, "created.us", b"fine").await.unwrap();
    service.publish(&orders, "created.us", b"poison").await.unwrap();

    timeout(WAIT, async {
        while broker.settled().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    let handled = consumer.await.unwrap().unwrap();
    assert_eq!(handled, 2);
    assert_eq!(
        broker.settled(),
        vec![
            (b"fine".to_vec(), Settlement::Ack),
            (b"poison".to_vec(), Settlement::Nack { requeue: true }),
        ]
    );
}

#[tokio::test]
async fn consume_ending_leaves_caller_token_alone() {
    let broker = MockBroker::new();
    let service = Arc::new(start(&broker).await);
    let app_token = CancellationToken::new();

    let consumer = {
        let service = service.clone();
        let token = app_token.clone();
        tokio::spawn(async move {
            service
                .consume(
                    token,
                    &Target::exchange("orders"),
                    ExchangeType::Topic,
                    "created.*",
                    |_msg: Incoming| async { Ok::<(), HandlerError>(()) },
                )
                .await
        })
    };

    timeout(WAIT, async {
        while broker.count("basic_consume") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    service.close().await.unwrap();
    let handled = timeout(WAIT, consumer).await.unwrap().unwrap().unwrap();
    assert_eq!(handled, 0);
    assert!(!app_token.is_cancelled());
}
