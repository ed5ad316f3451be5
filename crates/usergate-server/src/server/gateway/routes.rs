//! REST → gRPC translation handlers.
//!
//! Each route builds the matching `user.v1` request, forwards it over the
//! shared backend channel and renders the reply (or the error) as JSON.
//! Malformed bodies, queries and paths are rejected here with `400` and never
//! reach the backend.

use super::{
    cors, docs,
    translate::{
        CreateUserBody, GatewayError, ListQuery, ListUsersJson, UpdateUserBody, UserJson,
    },
};
use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{Method, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use tonic::transport::Channel;
use tonic_health::pb::{
    HealthCheckRequest, health_check_response::ServingStatus, health_client::HealthClient,
};
use tower_http::trace::TraceLayer;
use usergate_core::proto::{
    CreateUserRequest, DeleteUserRequest, GetUserRequest, ListUsersRequest, UpdateUserRequest,
    user_service_client::UserServiceClient,
};

type GatewayResult<T> = Result<T, GatewayError>;

/// Clients sharing the single backend connection.
#[derive(Clone)]
pub struct GatewayState {
    users: UserServiceClient<Channel>,
    health: HealthClient<Channel>,
    service_name: &'static str,
}

impl GatewayState {
    pub fn new(channel: Channel, service_name: &'static str) -> Self {
        Self {
            users: UserServiceClient::new(channel.clone()),
            health: HealthClient::new(channel),
            service_name,
        }
    }
}

/// The gateway's routing table, CORS outermost.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/v1/users", post(create_user).get(list_users))
        .route(
            "/api/v1/users/{id}",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route("/health", get(health))
        .route("/swagger.json", get(docs::swagger_json))
        .route("/swagger/", get(docs::swagger_ui))
        .route("/swagger", get(|| async { Redirect::permanent("/swagger/") }))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(cors::cors))
}

async fn create_user(
    State(state): State<GatewayState>,
    body: Result<Json<CreateUserBody>, JsonRejection>,
) -> GatewayResult<(StatusCode, Json<UserJson>)> {
    let Json(body) = body?;
    let user = state
        .users
        .clone()
        .create_user(CreateUserRequest {
            name: body.name,
            email: body.email,
            phone: body.phone,
        })
        .await?
        .into_inner();
    Ok((StatusCode::CREATED, Json(user.into())))
}

async fn get_user(
    State(state): State<GatewayState>,
    id: Result<Path<String>, PathRejection>,
) -> GatewayResult<Json<UserJson>> {
    let Path(id) = id?;
    let user = state
        .users
        .clone()
        .get_user(GetUserRequest { id })
        .await?
        .into_inner();
    Ok(Json(user.into()))
}

async fn list_users(
    State(state): State<GatewayState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> GatewayResult<Json<ListUsersJson>> {
    let Query(query) = query?;
    let page = state
        .users
        .clone()
        .list_users(ListUsersRequest {
            page: query.page,
            page_size: query.page_size,
        })
        .await?
        .into_inner();
    Ok(Json(page.into()))
}

async fn update_user(
    State(state): State<GatewayState>,
    id: Result<Path<String>, PathRejection>,
    body: Result<Json<UpdateUserBody>, JsonRejection>,
) -> GatewayResult<Json<UserJson>> {
    let Path(id) = id?;
    let Json(body) = body?;
    let user = state
        .users
        .clone()
        .update_user(UpdateUserRequest {
            id,
            name: body.name,
            email: body.email,
            phone: body.phone,
        })
        .await?
        .into_inner();
    Ok(Json(user.into()))
}

async fn delete_user(
    State(state): State<GatewayState>,
    id: Result<Path<String>, PathRejection>,
) -> GatewayResult<Json<serde_json::Value>> {
    let Path(id) = id?;
    state
        .users
        .clone()
        .delete_user(DeleteUserRequest { id })
        .await?;
    Ok(Json(serde_json::json!({})))
}

/// Reports the backend's health for the User service.
async fn health(State(state): State<GatewayState>) -> Response {
    let request = HealthCheckRequest {
        service: state.service_name.to_string(),
    };
    match state.health.clone().check(request).await {
        Ok(reply) => {
            let status = reply.into_inner().status();
            let code = if status == ServingStatus::Serving {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (
                code,
                Json(serde_json::json!({ "status": status.as_str_name() })),
            )
                .into_response()
        }
        Err(status) => GatewayError::from(status).into_response(),
    }
}

async fn not_found(uri: Uri) -> GatewayError {
    GatewayError::not_found(format!("no route for {}", uri.path()))
}

async fn method_not_allowed(method: Method, uri: Uri) -> GatewayError {
    GatewayError::method_not_allowed(format!("{method} is not supported on {}", uri.path()))
}
