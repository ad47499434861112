//! HTTP error mapping.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use loragate_values::GatewayError;
use serde::Serialize;

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Gateway error carried to the HTTP boundary.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

/// Problem-details body returned for every error.
#[derive(Debug, Serialize)]
struct ProblemDetails {
    /// URI reference identifying the problem type
    #[serde(rename = "type")]
    type_uri: String,
    /// Short machine-readable error kind
    title: String,
    /// HTTP status code
    status: u16,
    /// Human-readable explanation
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let problem = ProblemDetails {
            type_uri: format!("https://loragate.dev/errors/{}", self.0.kind()),
            title: self.0.kind().to_string(),
            status: status.as_u16(),
            detail: self.0.to_string(),
        };

        let mut response = (status, Json(problem)).into_response();
        if matches!(self.0, GatewayError::AuthMissing) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_missing_carries_www_authenticate() {
        let response = ApiError(GatewayError::AuthMissing).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );
    }

    #[test]
    fn scope_denied_is_403() {
        let response =
            ApiError(GatewayError::ScopeDenied { model: "other".into() }).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
