use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::admission::AdmissionError;
use crate::image::ReferenceError;
use crate::scheduler::ScheduleError;

/// Seconds a client should wait before retrying a refused request.
const RETRY_AFTER_SECONDS: u32 = 5;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub retry_after_seconds: Option<u32>,
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
            retry_after_seconds: Some(RETRY_AFTER_SECONDS),
        }
    }
}

impl From<ReferenceError> for ApiError {
    fn from(err: ReferenceError) -> Self {
        Self::internal(format!("while parsing image reference '{err}'"))
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::QueueFull => Self::service_unavailable(err.to_string()),
            ScheduleError::Closed => Self::internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response();

        if let Some(seconds) = self.retry_after_seconds {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    async fn body(response: Response) -> ErrorBody {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_parse_error_is_json_500() {
        let err = ReferenceError::Empty;
        let response = ApiError::from(err).into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get(RETRY_AFTER).is_none());
        assert!(body(response)
            .await
            .error
            .starts_with("while parsing image reference"));
    }

    #[tokio::test]
    async fn test_queue_full_is_retryable_503() {
        let response = ApiError::from(ScheduleError::QueueFull).into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], "5");
        assert_eq!(body(response).await.error, "fetch queue is full");
    }

    #[tokio::test]
    async fn test_size_exceeded_message() {
        let err = AdmissionError::SizeExceeded {
            size: 15_000_000,
            limit: 10_000_000,
        };
        let response = ApiError::from(err).into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body(response).await.error,
            "max size exceeded: image 15000000, threshold 10000000"
        );
    }
}
