//! Shared HTTP plumbing for the forge clients.

use bellows_core::error::BellowsError;
use reqwest::StatusCode;

/// Map an HTTP status to the controller's error taxonomy.
///
/// | status    | kind         |
/// |-----------|--------------|
/// | 400 / 422 | BadRequest   |
/// | 401 / 403 | Unauthorized |
/// | 404       | NotFound     |
/// | 409       | Conflict     |
/// | other     | Transient    |
pub fn error_from_status(status: StatusCode, context: &str, body: &str) -> BellowsError {
    let detail = if body.is_empty() {
        format!("{}: HTTP {}", context, status.as_u16())
    } else {
        let mut body = body.to_string();
        body.truncate(256);
        format!("{}: HTTP {}: {}", context, status.as_u16(), body)
    };
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            BellowsError::BadRequest(detail)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BellowsError::Unauthorized(detail),
        StatusCode::NOT_FOUND => BellowsError::NotFound(detail),
        StatusCode::CONFLICT => BellowsError::Conflict(detail),
        _ => BellowsError::Transient(detail),
    }
}

/// Map a transport failure.
pub fn error_from_transport(err: reqwest::Error, context: &str) -> BellowsError {
    BellowsError::Transient(format!("{}: {}", context, err))
}

/// Consume a response: non-success statuses become taxonomy errors with the
/// body preserved for context.
pub async fn check_response(
    response: reqwest::Response,
    context: &str,
) -> bellows_core::error::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_from_status(status, context, &body))
}
