use std::fmt;

use http::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An error deserialized from a B2 API error envelope.
#[derive(Debug, Clone, Error, Deserialize)]
#[serde(from = "RawErrorInfo")]
#[error("{status}: {message} ({code})")]
pub struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
}

impl ApiError {
    /// The HTTP status code of the response.
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// The error code returned by the B2 API.
    pub fn code(&self) -> &ErrorCode {
        &self.code
    }

    /// The error message returned by the B2 API.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Classify this service error for the retry policies.
    pub fn kind(&self) -> ErrorKind {
        match self.code {
            ErrorCode::BadAuthToken | ErrorCode::ExpiredAuthToken => ErrorKind::Authentication,
            ErrorCode::BadDigest => ErrorKind::InvalidHash,
            ErrorCode::CapExceeded => ErrorKind::CapExceeded,
            _ => status_kind(self.status),
        }
    }
}

/// Classify a bare HTTP status the way the service codes would.
pub(crate) fn status_kind(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::UNAUTHORIZED => ErrorKind::Authentication,
        StatusCode::BAD_REQUEST => ErrorKind::BadRequest,
        StatusCode::FORBIDDEN => ErrorKind::Forbidden,
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::CONFLICT => ErrorKind::Conflict,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ErrorKind::Transient,
        status if status.is_server_error() => ErrorKind::Transient,
        _ => ErrorKind::Other,
    }
}

/// An error code returned by the B2 API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// The authorization token is not valid for this call.
    BadAuthToken,

    /// The authorization token has expired, and should be refreshed.
    ExpiredAuthToken,

    /// The uploaded body did not match its declared SHA-1.
    BadDigest,

    /// A usage cap on the account was reached.
    CapExceeded,

    /// The request was malformed or invalid.
    BadRequest,

    /// The requested object does not exist.
    NotFound,

    /// The request conflicted with the current state of the object.
    Conflict,

    /// The service is temporarily unable to handle the request.
    ServiceUnavailable,

    /// An error code not recognized by this library.
    Other(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::BadAuthToken => f.write_str("bad_auth_token"),
            ErrorCode::ExpiredAuthToken => f.write_str("expired_auth_token"),
            ErrorCode::BadDigest => f.write_str("bad_digest"),
            ErrorCode::CapExceeded => f.write_str("cap_exceeded"),
            ErrorCode::BadRequest => f.write_str("bad_request"),
            ErrorCode::NotFound => f.write_str("not_found"),
            ErrorCode::Conflict => f.write_str("conflict"),
            ErrorCode::ServiceUnavailable => f.write_str("service_unavailable"),
            ErrorCode::Other(message) => f.write_str(message),
        }
    }
}

impl From<String> for ErrorCode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "bad_auth_token" => ErrorCode::BadAuthToken,
            "expired_auth_token" => ErrorCode::ExpiredAuthToken,
            "bad_digest" => ErrorCode::BadDigest,
            "cap_exceeded" | "storage_cap_exceeded" | "transaction_cap_exceeded" => {
                ErrorCode::CapExceeded
            }
            "bad_request" => ErrorCode::BadRequest,
            "not_found" | "no_such_file" => ErrorCode::NotFound,
            "conflict" => ErrorCode::Conflict,
            "service_unavailable" => ErrorCode::ServiceUnavailable,
            _ => ErrorCode::Other(value),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawErrorInfo {
    status: u16,
    code: String,
    message: String,
}

impl From<RawErrorInfo> for ApiError {
    fn from(value: RawErrorInfo) -> Self {
        ApiError {
            status: StatusCode::from_u16(value.status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: value.code.into(),
            message: value.message,
        }
    }
}

/// The classification the retry policies act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The authorization token was rejected or has expired.
    Authentication,

    /// A content digest did not match the transferred bytes.
    InvalidHash,

    /// The fault is expected to clear on its own (timeouts, 5xx, resets).
    Transient,

    /// A usage cap on the account was reached.
    CapExceeded,

    /// The requested object does not exist.
    NotFound,

    /// The request was malformed or invalid.
    BadRequest,

    /// The request conflicted with the current state of the object.
    Conflict,

    /// The credentials are not allowed to perform this call.
    Forbidden,

    /// A cancellation signal was observed.
    Cancelled,

    /// Anything else; never retried.
    Other,
}

/// An error that occurred while making a request to the B2 API.
///
/// This can include errors from the B2 API itself, as well as errors from
/// the client or the network.
#[derive(Debug, Error)]
pub enum Error {
    /// An error returned by the B2 API.
    #[error("{op}: {source}")]
    Api {
        /// The B2 operation that failed.
        op: &'static str,
        /// The deserialized error envelope.
        #[source]
        source: ApiError,
    },

    /// A non-success response without a service envelope (HEAD probes).
    #[error(transparent)]
    Http(#[from] api_kit::HttpResponseError),

    /// An error deserializing a response from the B2 API.
    #[error("deserializing: {0} {1}")]
    Serde(#[source] serde_json::Error, String),

    /// An io error occurred, probably from a source or sink.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// An error occurred while reading a response body.
    #[error("body: {0}")]
    Body(#[source] BoxError),

    /// An error occurred while making a request to the B2 API.
    #[error("client: {0}")]
    Client(#[from] hyperdriver::client::Error),

    /// A request could not be constructed.
    #[error("request: {0}")]
    Request(#[from] http::Error),

    /// A request URI could not be composed.
    #[error("uri: {0}")]
    Uri(#[from] api_kit::uri::QueryError),

    /// A SHA-1 digest did not match the transferred content.
    #[error("{op}: content sha1 mismatch (expected {expected}, got {actual})")]
    Digest {
        /// The B2 operation that failed.
        op: &'static str,
        /// The digest this side computed.
        expected: String,
        /// The digest reported for the transferred bytes.
        actual: String,
    },

    /// A ranged read returned the wrong number of bytes.
    #[error("{op}: expected {expected} bytes, received {received}")]
    UnexpectedLength {
        /// The B2 operation that failed.
        op: &'static str,
        /// The requested byte count.
        expected: u64,
        /// The byte count actually received.
        received: u64,
    },

    /// A probe response did not advertise a length.
    #[error("{op}: response did not include a Content-Length")]
    MissingLength {
        /// The B2 operation that failed.
        op: &'static str,
    },

    /// The stream is too large for a single request and cannot be rewound
    /// for a chunked upload.
    #[error("stream of {length} bytes exceeds the single-request cutoff of {cutoff} and cannot be rewound")]
    Unrewindable {
        /// The stream length.
        length: u64,
        /// The effective single-request cutoff.
        cutoff: u64,
    },

    /// No bucket with the given name is visible to this key.
    #[error("no bucket named {0}")]
    UnknownBucket(String),

    /// The session has not been connected yet.
    #[error("session is not authorized")]
    NotConnected,

    /// The session has been closed.
    #[error("session is closed")]
    Closed,

    /// A cancellation signal was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// A transfer failed after moving some bytes.
    #[error("transfer interrupted at byte {offset}")]
    Interrupted {
        /// Bytes successfully transferred before the failure.
        offset: u64,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// The request encountered too many recoverable errors during retries.
    #[error("{op}: retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// The B2 operation that failed.
        op: &'static str,
        /// How many retries were spent.
        attempts: u32,
        /// The last error observed.
        #[source]
        last: Box<Error>,
    },
}

impl Error {
    /// Classify this error for the retry policies.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Api { source, .. } => source.kind(),
            Error::Http(source) => status_kind(source.status),
            Error::Serde(_, _) | Error::Body(_) | Error::Io(_) => ErrorKind::Other,
            Error::Client(_) => ErrorKind::Transient,
            Error::Request(_) | Error::Uri(_) => ErrorKind::BadRequest,
            Error::Digest { .. } => ErrorKind::InvalidHash,
            Error::UnexpectedLength { .. } => ErrorKind::Transient,
            Error::MissingLength { .. } => ErrorKind::Other,
            Error::Unrewindable { .. } => ErrorKind::BadRequest,
            Error::UnknownBucket(_) => ErrorKind::NotFound,
            Error::NotConnected => ErrorKind::Authentication,
            Error::Closed => ErrorKind::Other,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Interrupted { source, .. } => source.kind(),
            Error::RetriesExhausted { .. } => ErrorKind::Other,
        }
    }

    /// Get a reference to the service error envelope, if there is one.
    pub fn api(&self) -> Option<&ApiError> {
        match self {
            Error::Api { source, .. } => Some(source),
            Error::Interrupted { source, .. } => source.api(),
            Error::RetriesExhausted { last, .. } => last.api(),
            _ => None,
        }
    }
}

/// Wrap a terminal transfer error with the offset already moved, so partial
/// transfers never silently discard bytes.
pub(crate) fn interrupted_at(offset: u64, error: Error) -> Error {
    if offset == 0 || matches!(error, Error::Interrupted { .. }) {
        return error;
    }
    Error::Interrupted {
        offset,
        source: Box::new(error),
    }
}

#[async_trait::async_trait]
pub(crate) trait EnvelopeExt {
    /// Deserialize the response body, surfacing the service error envelope
    /// on non-success statuses.
    async fn deserialize<D: DeserializeOwned>(self, op: &'static str) -> Result<D, Error>;

    /// Surface the service error envelope on non-success statuses.
    async fn check(self, op: &'static str) -> Result<Self, Error>
    where
        Self: Sized;
}

#[async_trait::async_trait]
impl EnvelopeExt for api_kit::Response {
    async fn check(self, op: &'static str) -> Result<Self, Error> {
        if self.status().is_success() {
            Ok(self)
        } else {
            let uri = self.uri().clone();
            let text = self.text().await.map_err(Error::Body)?;

            let source: ApiError =
                serde_json::from_str(&text).map_err(|err| Error::Serde(err, text.clone()))?;
            tracing::debug!(%uri, op, code = %source.code(), "b2 api error");
            Err(Error::Api { op, source })
        }
    }

    async fn deserialize<D: DeserializeOwned>(self, op: &'static str) -> Result<D, Error> {
        let resp = self.check(op).await?;

        let text = resp.text().await.map_err(Error::Body)?;

        let resp =
            serde_json::from_str(&text).map_err(|err| Error::Serde(err, text.clone()))?;
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(status: u16, code: &str) -> ApiError {
        serde_json::from_value(serde_json::json!({
            "status": status,
            "code": code,
            "message": "test message",
        }))
        .unwrap()
    }

    #[test]
    fn auth_codes_classify_as_authentication() {
        assert_eq!(
            envelope(401, "expired_auth_token").kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            envelope(401, "bad_auth_token").kind(),
            ErrorKind::Authentication
        );
        // The code wins even when the status is unusual.
        assert_eq!(
            envelope(503, "expired_auth_token").kind(),
            ErrorKind::Authentication
        );
    }

    #[test]
    fn digest_code_classifies_as_invalid_hash() {
        assert_eq!(envelope(400, "bad_digest").kind(), ErrorKind::InvalidHash);
    }

    #[test]
    fn cap_codes_collapse_to_cap_exceeded() {
        assert_eq!(envelope(403, "cap_exceeded").kind(), ErrorKind::CapExceeded);
        assert_eq!(
            envelope(403, "storage_cap_exceeded").kind(),
            ErrorKind::CapExceeded
        );
    }

    #[test]
    fn statuses_drive_the_remaining_kinds() {
        assert_eq!(envelope(400, "nope").kind(), ErrorKind::BadRequest);
        assert_eq!(envelope(403, "denied").kind(), ErrorKind::Forbidden);
        assert_eq!(envelope(404, "missing").kind(), ErrorKind::NotFound);
        assert_eq!(envelope(409, "busy").kind(), ErrorKind::Conflict);
        assert_eq!(envelope(408, "slow").kind(), ErrorKind::Transient);
        assert_eq!(envelope(429, "limited").kind(), ErrorKind::Transient);
        assert_eq!(envelope(503, "down").kind(), ErrorKind::Transient);
    }

    #[test]
    fn interrupted_preserves_the_inner_kind() {
        let inner = Error::Api {
            op: "b2_upload_part",
            source: envelope(503, "service_unavailable"),
        };
        let wrapped = interrupted_at(1024, inner);
        assert_eq!(wrapped.kind(), ErrorKind::Transient);
        assert!(wrapped.api().is_some());
    }

    #[test]
    fn zero_offset_does_not_wrap() {
        let inner = Error::Cancelled;
        assert!(matches!(interrupted_at(0, inner), Error::Cancelled));
    }
}
