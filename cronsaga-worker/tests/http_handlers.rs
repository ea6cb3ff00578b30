use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use chrono::Utc;
use cronsaga_broker::{
    Broker, ConnectionMonitor, DispatchSettings, Dispatcher, in_memory::InMemoryBroker,
};
use cronsaga_comm::{ChannelMessage, SagaStepMessage, StepPhase, StepResult, TaskDispatch};
use cronsaga_models::core::CorrelationId;
use cronsaga_utilities::ComponentLogger;
use cronsaga_worker::{
    DeliveryContext, HandlerError, HttpTaskHandler, MessageHandler, SagaStepHandler,
    effect::IDEMPOTENCY_KEY_HEADER,
};
use parking_lot::Mutex;
use reqwest::Url;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use uuid::Uuid;

type Seen = Arc<Mutex<Vec<(Option<String>, Value)>>>;

async fn record(State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>) -> StatusCode {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    seen.lock().push((key, body));
    StatusCode::OK
}

async fn reserve(State(seen): State<Seen>, Json(body): Json<Value>) -> Json<Value> {
    seen.lock().push((None, body));
    Json(json!({"reservation": "r-1"}))
}

async fn refuse() -> (StatusCode, &'static str) {
    (StatusCode::UNPROCESSABLE_ENTITY, "card declined")
}

async fn unavailable() -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

async fn start_service() -> (Url, Seen) {
    let seen: Seen = Arc::default();
    let app = Router::new()
        .route("/hook", post(record))
        .route("/refuse", post(refuse))
        .route("/down", post(unavailable))
        .route("/inventory/reserve", post(reserve))
        .route("/billing/charge", post(refuse))
        .route("/payments/capture", post(unavailable))
        .route("/payments/refund", post(unavailable))
        .with_state(seen.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (Url::parse(&format!("http://{addr}/")).unwrap(), seen)
}

fn logger(component: &str) -> ComponentLogger {
    ComponentLogger::new("cronsaga-worker", component)
}

fn context(message: &ChannelMessage) -> DeliveryContext {
    DeliveryContext {
        delivery_id: Uuid::new_v4(),
        queue: "tasks".into(),
        dedupe_key: message.dedupe_key(),
        attempt: 1,
        correlation_id: message.correlation_id(),
    }
}

fn task_message() -> ChannelMessage {
    ChannelMessage::TaskDispatch(TaskDispatch {
        task_id: Uuid::new_v4(),
        payload: json!({"report": "weekly"}),
        fired_at: Utc::now(),
        correlation_id: CorrelationId::new(),
    })
}

fn step_message(service: &str, action: &str) -> ChannelMessage {
    ChannelMessage::SagaStep(SagaStepMessage {
        saga_id: Uuid::new_v4(),
        step_id: format!("{service}-{action}"),
        service: service.into(),
        action: action.into(),
        payload: json!({"order": 42}),
        phase: StepPhase::Forward,
        reply_to: "saga-outcomes".into(),
        correlation_id: CorrelationId::new(),
    })
}

fn saga_handler(base: &Url, broker: &InMemoryBroker) -> SagaStepHandler {
    let mut endpoints = HashMap::new();
    endpoints.insert("inventory".to_string(), base.join("inventory").unwrap());
    endpoints.insert("billing".to_string(), base.join("billing/").unwrap());
    endpoints.insert("payments".to_string(), base.join("payments/").unwrap());
    let dispatcher = Dispatcher::new(
        Arc::new(broker.clone()),
        ConnectionMonitor::always_connected(),
        DispatchSettings::default(),
        logger("dispatcher"),
    );
    SagaStepHandler::new(reqwest::Client::new(), endpoints, dispatcher, logger("saga-step-handler"))
        .with_max_attempts(3)
}

fn on_attempt(message: &ChannelMessage, attempt: u32) -> DeliveryContext {
    DeliveryContext {
        attempt,
        ..context(message)
    }
}

async fn published_outcome(broker: &InMemoryBroker) -> StepResult {
    let delivery = broker.poll("saga-outcomes", "coordinator").await.unwrap().unwrap();
    match delivery.body {
        ChannelMessage::SagaOutcome(outcome) => outcome.result,
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn task_webhook_receives_idempotency_key() {
    let (base, seen) = start_service().await;
    let handler = HttpTaskHandler::new(
        reqwest::Client::new(),
        Some(base.join("hook").unwrap()),
        logger("task-handler"),
    );
    let message = task_message();
    let context = context(&message);

    handler.handle(&message, &context).await.unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0.as_deref(), Some(context.dedupe_key.as_str()));
    assert_eq!(seen[0].1["payload"], json!({"report": "weekly"}));
}

#[tokio::test]
async fn webhook_status_decides_failure_kind() {
    let (base, _) = start_service().await;
    let message = task_message();
    let context = context(&message);

    let refusing = HttpTaskHandler::new(reqwest::Client::new(), Some(base.join("refuse").unwrap()), logger("task-handler"));
    let err = refusing.handle(&message, &context).await.unwrap_err();
    assert!(matches!(err, HandlerError::Permanent(reason) if reason.contains("card declined")));

    let down = HttpTaskHandler::new(reqwest::Client::new(), Some(base.join("down").unwrap()), logger("task-handler"));
    let err = down.handle(&message, &context).await.unwrap_err();
    assert!(matches!(err, HandlerError::Transient(_)));
}

#[tokio::test]
async fn task_without_webhook_is_logged_only() {
    let handler = HttpTaskHandler::new(reqwest::Client::new(), None, logger("task-handler"));
    let message = task_message();
    handler.handle(&message, &context(&message)).await.unwrap();
}

#[tokio::test]
async fn completed_step_reports_output_to_reply_queue() {
    let (base, seen) = start_service().await;
    let broker = InMemoryBroker::new();
    let handler = saga_handler(&base, &broker);
    let message = step_message("inventory", "reserve");

    handler.handle(&message, &context(&message)).await.unwrap();

    assert_eq!(
        published_outcome(&broker).await,
        StepResult::Completed {
            output: json!({"reservation": "r-1"})
        }
    );
    assert_eq!(seen.lock()[0].1["payload"], json!({"order": 42}));
}

#[tokio::test]
async fn refused_step_reports_failure() {
    let (base, _) = start_service().await;
    let broker = InMemoryBroker::new();
    let handler = saga_handler(&base, &broker);
    let message = step_message("billing", "charge");

    handler.handle(&message, &context(&message)).await.unwrap();

    match published_outcome(&broker).await {
        StepResult::Failed { error } => assert!(error.contains("card declined")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_service_reports_failure() {
    let (base, _) = start_service().await;
    let broker = InMemoryBroker::new();
    let handler = saga_handler(&base, &broker);
    let message = step_message("shipping", "book");

    tokio::time::timeout(Duration::from_secs(5), handler.handle(&message, &context(&message)))
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(published_outcome(&broker).await, StepResult::Failed { .. }));
}

#[tokio::test]
async fn unavailable_service_is_retried_before_the_last_attempt() {
    let (base, _) = start_service().await;
    let broker = InMemoryBroker::new();
    let handler = saga_handler(&base, &broker);
    let message = step_message("payments", "capture");

    let err = handler.handle(&message, &on_attempt(&message, 2)).await.unwrap_err();

    assert!(matches!(err, HandlerError::Transient(_)));
    assert_eq!(broker.depth("saga-outcomes"), 0);
}

#[tokio::test]
async fn unavailable_service_on_last_attempt_reports_failure() {
    let (base, _) = start_service().await;
    let broker = InMemoryBroker::new();
    let handler = saga_handler(&base, &broker);
    let message = step_message("payments", "capture");

    handler.handle(&message, &on_attempt(&message, 3)).await.unwrap();

    match published_outcome(&broker).await {
        StepResult::Failed { error } => assert!(error.contains("gave up after 3 attempt(s)")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_compensation_on_last_attempt_reports_failure() {
    let (base, _) = start_service().await;
    let broker = InMemoryBroker::new();
    let handler = saga_handler(&base, &broker);
    let ChannelMessage::SagaStep(mut step) = step_message("payments", "refund") else {
        unreachable!()
    };
    step.phase = StepPhase::Compensate;
    let message = ChannelMessage::SagaStep(step);

    handler.handle(&message, &on_attempt(&message, 3)).await.unwrap();

    let delivery = broker.poll("saga-outcomes", "coordinator").await.unwrap().unwrap();
    let ChannelMessage::SagaOutcome(outcome) = delivery.body else {
        panic!("expected an outcome");
    };
    assert_eq!(outcome.phase, StepPhase::Compensate);
    assert!(matches!(outcome.result, StepResult::Failed { .. }));
}
