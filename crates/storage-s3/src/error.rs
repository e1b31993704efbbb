//! Mapping of AWS SDK failures onto `StoreError`.

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use rusty_transfer::{ObjectLocation, StoreError};

const THROTTLING_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
];

/// Map an HTTP error response to a `StoreError`.
///
/// # Arguments
/// * `status` - HTTP status code
/// * `code` - S3 error code (e.g. `NoSuchKey`), if present
/// * `message` - Error message from the response
/// * `location` - Object the request targeted
pub fn map_status(status: u16, code: Option<&str>, message: String, location: &ObjectLocation) -> StoreError {
    let throttled: bool = code.is_some_and(|c| THROTTLING_CODES.contains(&c));

    match status {
        _ if status == 429 || throttled => StoreError::Throttled { message },
        404 => StoreError::NotFound {
            bucket: location.bucket.clone(),
            key: location.key.clone(),
        },
        403 => StoreError::AccessDenied {
            bucket: location.bucket.clone(),
            key: location.key.clone(),
            message,
        },
        _ => StoreError::ServiceError {
            status,
            code: code.map(str::to_string),
            message,
        },
    }
}

/// Map any SDK operation error to a `StoreError`.
pub(crate) fn map_sdk_error<E>(err: SdkError<E, HttpResponse>, location: &ObjectLocation) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match &err {
        SdkError::TimeoutError(_) => StoreError::Timeout {
            message: format!("request for {} timed out", location),
        },
        SdkError::DispatchFailure(failure) => {
            if failure.is_timeout() {
                StoreError::Timeout {
                    message: format!("request for {} timed out: {:?}", location, failure),
                }
            } else {
                StoreError::NetworkError {
                    message: format!("failed to send request for {}: {:?}", location, failure),
                    retryable: true,
                }
            }
        }
        SdkError::ConstructionFailure(_) => StoreError::InvalidRequest {
            message: format!("failed to build request for {}: {}", location, describe(&err)),
        },
        _ => {
            let message: String = describe(&err);
            match err.raw_response().map(|r| r.status().as_u16()) {
                Some(status) => map_status(status, err.code(), message, location),
                // Response that could not be parsed; usually a truncated body.
                None => StoreError::NetworkError {
                    message,
                    retryable: true,
                },
            }
        }
    }
}

fn describe<E>(err: &SdkError<E, HttpResponse>) -> String
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match (err.code(), err.message()) {
        (Some(code), Some(message)) => format!("{}: {}", code, message),
        (Some(code), None) => code.to_string(),
        (None, Some(message)) => message.to_string(),
        (None, None) => err.to_string(),
    }
}
