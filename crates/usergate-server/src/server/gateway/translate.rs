//! JSON shapes of the REST surface and the gRPC → HTTP error mapping.

use axum::{
    Json,
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tonic::{Code, Status};
use usergate_core::proto::{ListUsersResponse, User};

/// A user as rendered by the gateway. Timestamps are RFC 3339 strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserJson {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl From<User> for UserJson {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
            phone: user.phone,
            created_at: user.created_at.map(|ts| ts.to_string()),
            updated_at: user.updated_at.map(|ts| ts.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListUsersJson {
    pub users: Vec<UserJson>,
    pub total: i32,
    pub page: i32,
    pub page_size: i32,
}

impl From<ListUsersResponse> for ListUsersJson {
    fn from(res: ListUsersResponse) -> Self {
        Self {
            users: res.users.into_iter().map(UserJson::from).collect(),
            total: res.total,
            page: res.page,
            page_size: res.page_size,
        }
    }
}

/// Body of `POST /api/v1/users`. Missing fields default to empty strings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateUserBody {
    pub name: String,
    pub email: String,
    pub phone: String,
}

/// Body of `PUT /api/v1/users/{id}`. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateUserBody {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Query of `GET /api/v1/users`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    pub page: i32,
    pub page_size: i32,
}

/// Error body shared by every non-2xx gateway response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
    pub details: Vec<serde_json::Value>,
}

/// HTTP status for a gRPC code.
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            StatusCode::BAD_REQUEST
        }
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        // nginx's "client closed request"
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A failed gateway request, rendered as [`ErrorBody`].
#[derive(Debug)]
pub struct GatewayError {
    status: StatusCode,
    body: ErrorBody,
}

impl GatewayError {
    fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            status: http_status(code),
            body: ErrorBody {
                code: code as i32,
                message: message.into(),
                details: Vec::new(),
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    /// Known route, unsupported method. Reported as `UNIMPLEMENTED`, like
    /// grpc-gateway does.
    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Status> for GatewayError {
    fn from(status: Status) -> Self {
        Self::new(status.code(), status.message())
    }
}

impl From<JsonRejection> for GatewayError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for GatewayError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for GatewayError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
