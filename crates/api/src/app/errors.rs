use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use sizeflow_infra::StoreError;
use sizeflow_messaging::DecodeError;

pub fn decode_error_to_response(err: DecodeError) -> axum::response::Response {
    match err {
        DecodeError::Malformed { .. } => json_error(StatusCode::BAD_REQUEST, "malformed_payload", err.to_string()),
        DecodeError::UnrecognizedShape(_) => {
            json_error(StatusCode::BAD_REQUEST, "unrecognized_payload", err.to_string())
        }
        DecodeError::InvalidPhone(_) => json_error(StatusCode::BAD_REQUEST, "invalid_phone", err.to_string()),
        DecodeError::NoMessage => json_error(StatusCode::BAD_REQUEST, "no_message", err.to_string()),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
