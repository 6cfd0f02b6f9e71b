//! Transfer engine for Backblaze B2 Cloud Storage.
//!
//! A [`Session`] owns the account credentials and the HTTP executor, and
//! exposes the B2 endpoint surface together with two orchestrators:
//! [`Session::upload`], which switches between single-request and chunked
//! large-file uploads, and [`Session::download_by_name`] /
//! [`Session::download_by_id`], which switch between direct and ranged
//! parallel downloads. Short-lived upload URLs are pooled per bucket and per
//! large file, authorization tokens rotate transparently, and content is
//! verified with SHA-1 end to end.

mod application;
mod bucket;
mod cache;
mod client;
mod config;
mod download;
mod errors;
mod file;
mod io;
mod parts;
mod policy;
mod progress;
mod upload;

/// Version segment of B2 API paths.
const B2_API_PATH: &str = "b2api/v2";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Default connect timeout.
const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub use api_kit::Secret;

pub use crate::application::{Allowed, ApplicationKey, Authorization};
pub use crate::bucket::{Bucket, BucketId, BucketSelector, BucketType};
pub use crate::cache::UrlLease;
pub use crate::client::{Session, TransferOptions};
pub use crate::config::{TestMode, TransferConfig};
pub use crate::errors::{ApiError, Error, ErrorCode, ErrorKind};
pub use crate::file::{Action, BzMime, FileId, FileInfo, FileNamePage};
pub use crate::io::{ContentDigest, FileSink, FileSource, MemorySink, RangedSink, RangedSource};
pub use crate::parts::Part;
pub use crate::progress::{Progress, ProgressFn};
