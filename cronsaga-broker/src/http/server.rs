use crate::{
    http::types::{
        AckRequest, DeadLettersRequest, DeadLettersResponse, ErrorResponse, PollRequest,
        PollResponse, PublishRequest, RejectRequest,
    },
    Broker, BrokerError,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, info};
use serde::Serialize;
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;

struct AppState<B> {
    broker: Arc<B>,
}

impl<B> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
        }
    }
}

pub fn router<B>(broker: Arc<B>) -> Router
where
    B: Broker,
{
    let state = AppState { broker };

    Router::new()
        .route("/publish", post(publish::<B>))
        .route("/poll", post(poll::<B>))
        .route("/ack", post(ack::<B>))
        .route("/nack", post(nack::<B>))
        .route("/reject", post(reject::<B>))
        .route("/dead_letters", post(dead_letters::<B>))
        .route("/health", get(health::<B>))
        .with_state(state)
}

/// Serves the broker on an already bound listener until `shutdown` resolves.
pub async fn serve<B, F>(
    listener: TcpListener,
    broker: Arc<B>,
    shutdown: F,
) -> Result<(), std::io::Error>
where
    B: Broker,
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(broker))
        .with_graceful_shutdown(shutdown)
        .await
}

pub async fn run_server<B, F>(addr: SocketAddr, broker: B, shutdown: F) -> Result<(), std::io::Error>
where
    B: Broker,
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!("Broker listening on {}", listener.local_addr()?);
    serve(listener, Arc::new(broker), shutdown).await
}

async fn publish<B>(
    State(state): State<AppState<B>>,
    Json(request): Json<PublishRequest>,
) -> Response
where
    B: Broker,
{
    respond(
        state.broker.publish(request.message).await,
        StatusCode::CREATED,
    )
}

async fn poll<B>(State(state): State<AppState<B>>, Json(request): Json<PollRequest>) -> Response
where
    B: Broker,
{
    let poll_result = if let Some(timeout_ms) = request.timeout_ms {
        let timeout = tokio::time::Duration::from_millis(timeout_ms);
        let poll = state.broker.poll(&request.queue, &request.consumer);
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    } else {
        state.broker.poll(&request.queue, &request.consumer).await
    };

    match poll_result {
        Ok(Some(delivery)) => json_response(
            StatusCode::OK,
            PollResponse {
                delivery: Some(delivery),
            },
        ),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn ack<B>(State(state): State<AppState<B>>, Json(request): Json<AckRequest>) -> Response
where
    B: Broker,
{
    respond(
        state
            .broker
            .ack(&request.consumer, request.delivery_id)
            .await,
        StatusCode::OK,
    )
}

async fn nack<B>(State(state): State<AppState<B>>, Json(request): Json<AckRequest>) -> Response
where
    B: Broker,
{
    respond(
        state
            .broker
            .nack(&request.consumer, request.delivery_id)
            .await,
        StatusCode::OK,
    )
}

async fn reject<B>(State(state): State<AppState<B>>, Json(request): Json<RejectRequest>) -> Response
where
    B: Broker,
{
    respond(
        state
            .broker
            .reject(&request.consumer, request.delivery_id, &request.reason)
            .await,
        StatusCode::OK,
    )
}

async fn dead_letters<B>(
    State(state): State<AppState<B>>,
    Json(request): Json<DeadLettersRequest>,
) -> Response
where
    B: Broker,
{
    match state.broker.dead_letters(&request.queue).await {
        Ok(dead_letters) => json_response(StatusCode::OK, DeadLettersResponse { dead_letters }),
        Err(err) => error_response(err),
    }
}

async fn health<B>(State(state): State<AppState<B>>) -> Response
where
    B: Broker,
{
    respond(state.broker.heartbeat().await, StatusCode::OK)
}

fn respond(result: Result<(), BrokerError>, success: StatusCode) -> Response {
    match result {
        Ok(_) => success.into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: BrokerError) -> Response {
    match err {
        BrokerError::Duplicate(dedupe) => {
            json_response(StatusCode::CONFLICT, error_body("duplicate", dedupe))
        }
        BrokerError::UnknownDelivery(id) => json_response(
            StatusCode::NOT_FOUND,
            error_body("unknown_delivery", id.to_string()),
        ),
        BrokerError::Unavailable(message) => json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("unavailable", message),
        ),
        BrokerError::Storage(message) => {
            error!("Broker storage failure: {}", message);
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("storage", message),
            )
        }
        BrokerError::Internal(message) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("internal", message),
        ),
    }
}

fn json_response<T>(status: StatusCode, payload: T) -> Response
where
    T: Serialize,
{
    (status, axum::Json(payload)).into_response()
}

fn error_body(code: &str, message: impl Into<String>) -> ErrorResponse {
    ErrorResponse {
        code: code.to_string(),
        message: message.into(),
    }
}
