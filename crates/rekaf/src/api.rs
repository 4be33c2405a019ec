use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::Error;
use crate::manager::{ConsumerManager, CreateConsumerRequest};

// Build an axum::Router exposing consumer instances over REST: create a
// consumer in a group, read a topic, commit offsets, delete the instance.
pub fn build_router(manager: Arc<ConsumerManager>) -> axum::Router<()> {
    use axum::routing::{delete, get, post};

    axum::Router::new()
        .route("/consumers/{group}", post(create_consumer))
        .route(
            "/consumers/{group}/instances/{instance}",
            delete(delete_consumer),
        )
        .route(
            "/consumers/{group}/instances/{instance}/offsets",
            post(commit_offsets),
        )
        .route(
            "/consumers/{group}/instances/{instance}/topics/{topic}",
            get(read_topic),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(manager)
}

#[tracing::instrument(skip(manager, request))]
async fn create_consumer(
    State(manager): State<Arc<ConsumerManager>>,
    Path(group): Path<String>,
    Json(request): Json<CreateConsumerRequest>,
) -> Response {
    match manager.create_consumer(&group, request) {
        Ok(instance_id) => {
            (StatusCode::OK, Json(serde_json::json!({"instance_id": instance_id})))
                .into_response()
        }
        Err(err) => error_response(err),
    }
}

#[derive(Debug, serde::Deserialize)]
struct ReadQuery {
    max_bytes: Option<usize>,
}

#[tracing::instrument(skip(manager, query))]
async fn read_topic(
    State(manager): State<Arc<ConsumerManager>>,
    Path((group, instance, topic)): Path<(String, String, String)>,
    Query(query): Query<ReadQuery>,
) -> Response {
    match manager
        .read(&group, &instance, &topic, query.max_bytes)
        .await
    {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(err) => error_response(err),
    }
}

#[tracing::instrument(skip(manager))]
async fn commit_offsets(
    State(manager): State<Arc<ConsumerManager>>,
    Path((group, instance)): Path<(String, String)>,
) -> Response {
    match manager.commit_offsets(&group, &instance).await {
        Ok(offsets) => (StatusCode::OK, Json(serde_json::json!({"offsets": offsets})))
            .into_response(),
        Err(err) => error_response(err),
    }
}

#[tracing::instrument(skip(manager))]
async fn delete_consumer(
    State(manager): State<Arc<ConsumerManager>>,
    Path((group, instance)): Path<(String, String)>,
) -> Response {
    match manager.delete_consumer(&group, &instance) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::NotFound => StatusCode::NOT_FOUND,
        Error::AlreadyExists(_) | Error::AlreadySubscribed(_) | Error::ShuttingDown => {
            StatusCode::CONFLICT
        }
        Error::BrokerInit(_) | Error::BrokerIo(_) | Error::Decode(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    tracing::warn!(error = %err, status = status.as_u16(), "request failed");
    (
        status,
        Json(serde_json::json!({
            "error_code": status.as_u16(),
            "message": err.to_string(),
        })),
    )
        .into_response()
}
