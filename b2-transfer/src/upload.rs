//! Upload endpoints and the upload orchestrator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use api_kit::Secret;
use bytes::Bytes;
use camino::Utf8Path;
use futures::StreamExt as _;
use http::{Method, Uri};
use hyperdriver::Body;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio_util::sync::CancellationToken;

use crate::bucket::BucketId;
use crate::cache::UrlLease;
use crate::client::{Session, TransferOptions};
use crate::errors::{interrupted_at, EnvelopeExt as _, Error};
use crate::file::{BzMime, FileId, FileInfo};
use crate::io::{digest_bytes, digest_source, ContentDigest, RangedSource};
use crate::parts::{effective_cutoff, effective_part_size, plan_parts, Part};
use crate::progress::ProgressTracker;

/// File info key under which the whole-file digest of a large upload is
/// recorded.
const LARGE_FILE_SHA1_KEY: &str = "large_file_sha1";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetUploadUrlBody<'b> {
    bucket_id: &'b BucketId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetUploadPartUrlBody<'f> {
    file_id: &'f FileId,
}

/// A `b2_get_upload_url` / `b2_get_upload_part_url` payload: one URL plus
/// the token scoped to it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadEndpoint {
    #[serde(with = "api_kit::uri::serde")]
    upload_url: Uri,
    authorization_token: Secret,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartLargeFileBody<'s> {
    bucket_id: &'s BucketId,
    file_name: &'s Utf8Path,
    content_type: &'s BzMime,
    file_info: &'s BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishLargeFileBody<'s> {
    file_id: &'s FileId,
    part_sha1_array: &'s [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelLargeFileBody<'f> {
    file_id: &'f FileId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(unused)]
struct UploadPartResponse {
    part_number: u32,
    content_sha1: String,
}

impl Session {
    /// Fetch a fresh upload URL for a bucket.
    #[tracing::instrument(skip(self))]
    pub async fn get_upload_url(&self, bucket: &BucketId) -> Result<UrlLease, Error> {
        self.run_transfer("b2_get_upload_url", &CancellationToken::new(), || {
            Box::pin(async move { self.op_get_upload_url(bucket).await })
        })
        .await
    }

    /// Fetch a fresh upload URL for the parts of a large file.
    #[tracing::instrument(skip_all, fields(file = %file))]
    pub async fn get_upload_part_url(&self, file: &FileId) -> Result<UrlLease, Error> {
        self.run_transfer("b2_get_upload_part_url", &CancellationToken::new(), || {
            Box::pin(async move { self.op_get_upload_part_url(file).await })
        })
        .await
    }

    async fn op_get_upload_url(&self, bucket: &BucketId) -> Result<UrlLease, Error> {
        let endpoint: UploadEndpoint = self
            .post_api("b2_get_upload_url", &GetUploadUrlBody { bucket_id: bucket })
            .await?
            .deserialize("b2_get_upload_url")
            .await?;

        Ok(UrlLease::new(endpoint.upload_url, endpoint.authorization_token))
    }

    async fn op_get_upload_part_url(&self, file: &FileId) -> Result<UrlLease, Error> {
        let endpoint: UploadEndpoint = self
            .post_api(
                "b2_get_upload_part_url",
                &GetUploadPartUrlBody { file_id: file },
            )
            .await?
            .deserialize("b2_get_upload_part_url")
            .await?;

        Ok(UrlLease::new(endpoint.upload_url, endpoint.authorization_token))
    }

    /// A pooled lease when one is available, otherwise a fresh URL.
    async fn lease_upload_url(&self, bucket: &BucketId) -> Result<UrlLease, Error> {
        if let Some(lease) = self.upload_urls.checkout(bucket) {
            return Ok(lease);
        }
        self.op_get_upload_url(bucket).await
    }

    async fn lease_part_url(&self, file: &FileId) -> Result<UrlLease, Error> {
        if let Some(lease) = self.part_urls.checkout(file) {
            return Ok(lease);
        }
        self.op_get_upload_part_url(file).await
    }

    /// Open a large-file session for `name` in `bucket`.
    pub async fn start_large_file(
        &self,
        bucket: &BucketId,
        name: &Utf8Path,
        content_type: &BzMime,
        info: &BTreeMap<String, String>,
    ) -> Result<FileInfo, Error> {
        self.start_large_file_with(bucket, name, content_type, info, &CancellationToken::new())
            .await
    }

    async fn start_large_file_with(
        &self,
        bucket: &BucketId,
        name: &Utf8Path,
        content_type: &BzMime,
        info: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<FileInfo, Error> {
        self.run_transfer("b2_start_large_file", cancel, || {
            Box::pin(async move {
                self.post_api(
                    "b2_start_large_file",
                    &StartLargeFileBody {
                        bucket_id: bucket,
                        file_name: name,
                        content_type,
                        file_info: info,
                    },
                )
                .await?
                .deserialize("b2_start_large_file")
                .await
            })
        })
        .await
    }

    /// Assemble an uploaded large file from its acknowledged parts.
    ///
    /// `part_sha1s` must hold the hex digest of every part, in part-number
    /// order.
    pub async fn finish_large_file(
        &self,
        file: &FileId,
        part_sha1s: &[String],
    ) -> Result<FileInfo, Error> {
        self.finish_large_file_with(file, part_sha1s, &CancellationToken::new())
            .await
    }

    async fn finish_large_file_with(
        &self,
        file: &FileId,
        part_sha1s: &[String],
        cancel: &CancellationToken,
    ) -> Result<FileInfo, Error> {
        self.run_transfer("b2_finish_large_file", cancel, || {
            Box::pin(async move {
                let info: FileInfo = self
                    .post_api(
                        "b2_finish_large_file",
                        &FinishLargeFileBody {
                            file_id: file,
                            part_sha1_array: part_sha1s,
                        },
                    )
                    .await?
                    .deserialize("b2_finish_large_file")
                    .await?;

                tracing::debug!(file = %info.id(), "finished large file upload");
                Ok(info)
            })
        })
        .await
    }

    /// Abandon an unfinished large file, discarding its uploaded parts.
    ///
    /// The orchestrator never calls this on its own: a failed or cancelled
    /// upload leaves the server-side session for the caller to clean up or
    /// resume.
    #[tracing::instrument(skip_all, fields(file = %file))]
    pub async fn cancel_large_file(&self, file: &FileId) -> Result<(), Error> {
        self.run_transfer("b2_cancel_large_file", &CancellationToken::new(), || {
            Box::pin(async move {
                self.post_api("b2_cancel_large_file", &CancelLargeFileBody { file_id: file })
                    .await?
                    .check("b2_cancel_large_file")
                    .await?;

                tracing::debug!(file = %file, "cancelled large file upload");
                Ok(())
            })
        })
        .await
    }

    async fn op_upload_file(
        &self,
        lease: &UrlLease,
        name: &Utf8Path,
        content_type: &BzMime,
        info: &BTreeMap<String, String>,
        body: Bytes,
        digest: &ContentDigest,
    ) -> Result<FileInfo, Error> {
        let encoded_name = utf8_percent_encode(name.as_str(), NON_ALPHANUMERIC);

        tracing::trace!("sending upload post request");
        let mut request = http::Request::builder()
            .method(Method::POST)
            .uri(lease.url().clone())
            .header(
                http::header::AUTHORIZATION,
                lease
                    .token()
                    .to_header()
                    .expect("upload token is a valid header value"),
            )
            .header("X-Bz-File-Name", encoded_name.to_string())
            .header(http::header::CONTENT_TYPE, content_type.to_string())
            .header(http::header::CONTENT_LENGTH, digest.length())
            .header("X-Bz-Content-Sha1", digest.hex());

        for (key, value) in info {
            request = request.header(
                format!("X-Bz-Info-{key}"),
                utf8_percent_encode(value, NON_ALPHANUMERIC).to_string(),
            );
        }

        let request = request.body(Body::from(body))?;

        let uploaded: FileInfo = self
            .execute("b2_upload_file", request)
            .await?
            .deserialize("b2_upload_file")
            .await?;

        if let Some(echo) = uploaded.content_sha1() {
            if !digest.matches(echo) {
                return Err(Error::Digest {
                    op: "b2_upload_file",
                    expected: digest.hex(),
                    actual: echo.to_owned(),
                });
            }
        }

        Ok(uploaded)
    }

    async fn op_upload_part(
        &self,
        lease: &UrlLease,
        number: u32,
        body: Bytes,
        digest: &ContentDigest,
    ) -> Result<(), Error> {
        tracing::trace!(part = number, "sending upload_part post request");

        let request = http::Request::builder()
            .method(Method::POST)
            .uri(lease.url().clone())
            .header(
                http::header::AUTHORIZATION,
                lease
                    .token()
                    .to_header()
                    .expect("upload token is a valid header value"),
            )
            .header("X-Bz-Part-Number", number)
            .header(http::header::CONTENT_LENGTH, digest.length())
            .header("X-Bz-Content-Sha1", digest.hex())
            .body(Body::from(body))?;

        let _: UploadPartResponse = self
            .execute("b2_upload_part", request)
            .await?
            .deserialize("b2_upload_part")
            .await?;

        Ok(())
    }

    /// Upload `source` as `name` in `bucket`.
    ///
    /// Sources below the effective cutoff go up in a single request;
    /// anything larger uses the large-file protocol with parts uploaded
    /// under the upload bulkhead. Returns the uploaded file's metadata.
    #[tracing::instrument(skip_all, fields(%bucket, %name, len = source.len()))]
    pub async fn upload(
        &self,
        bucket: &BucketId,
        name: &Utf8Path,
        content_type: Option<mime::Mime>,
        info: BTreeMap<String, String>,
        source: &dyn RangedSource,
        options: &TransferOptions,
    ) -> Result<FileInfo, Error> {
        let auth = self.ensure_connected().await?;
        let total = source.len();

        let part_size = effective_part_size(
            self.config().upload_part_size,
            auth.recommended_part_size(),
            auth.minimum_part_size(),
        );
        let cutoff = effective_cutoff(
            self.config().upload_cutoff_size,
            part_size,
            auth.minimum_part_size(),
        );

        let content_type = content_type.map_or(BzMime::Auto, BzMime::Mime);

        // A source that fits in one part gains nothing from the large-file
        // protocol, whatever the cutoff says.
        if total < cutoff || total <= part_size {
            self.upload_single(bucket, name, &content_type, &info, source, total, options)
                .await
        } else {
            self.upload_large(
                bucket,
                name,
                &content_type,
                info,
                source,
                total,
                part_size,
                options,
            )
            .await
        }
    }

    /// Upload a non-seekable stream as `name` in `bucket`.
    ///
    /// The stream is buffered to compute its digest, and must fit under the
    /// single-request cutoff; larger streams need a [`RangedSource`].
    #[tracing::instrument(skip_all, fields(%bucket, %name))]
    pub async fn upload_stream<R>(
        &self,
        bucket: &BucketId,
        name: &Utf8Path,
        content_type: Option<mime::Mime>,
        info: BTreeMap<String, String>,
        mut reader: R,
        options: &TransferOptions,
    ) -> Result<FileInfo, Error>
    where
        R: AsyncRead + Unpin + Send,
    {
        let auth = self.ensure_connected().await?;

        let part_size = effective_part_size(
            self.config().upload_part_size,
            auth.recommended_part_size(),
            auth.minimum_part_size(),
        );
        let cutoff = effective_cutoff(
            self.config().upload_cutoff_size,
            part_size,
            auth.minimum_part_size(),
        );

        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).await?;
        let body = Bytes::from(buffer);
        let total = RangedSource::len(&body);

        if total >= cutoff && total > part_size {
            return Err(Error::Unrewindable {
                length: total,
                cutoff,
            });
        }

        let content_type = content_type.map_or(BzMime::Auto, BzMime::Mime);
        self.upload_single(bucket, name, &content_type, &info, &body, total, options)
            .await
    }

    async fn upload_single(
        &self,
        bucket: &BucketId,
        name: &Utf8Path,
        content_type: &BzMime,
        info: &BTreeMap<String, String>,
        source: &dyn RangedSource,
        total: u64,
        options: &TransferOptions,
    ) -> Result<FileInfo, Error> {
        tracing::trace!("upload as single request");

        let digest = digest_source(source).await?;
        let body = source.read_at(0, total).await?;
        let tracker = ProgressTracker::new(total, options.progress.clone());

        let uploaded = self
            .run_transfer("b2_upload_file", &options.cancel, || {
                let body = body.clone();
                let digest = &digest;
                Box::pin(async move {
                    let _slot = self.uploads.acquire().await;

                    let lease = self.lease_upload_url(bucket).await?;
                    match self
                        .op_upload_file(&lease, name, content_type, info, body, digest)
                        .await
                    {
                        Ok(uploaded) => {
                            self.upload_urls.checkin(bucket, lease);
                            Ok(uploaded)
                        }
                        // The lease is dropped, which evicts the URL.
                        Err(error) => Err(error),
                    }
                })
            })
            .await?;

        tracker.record(total);
        Ok(uploaded)
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_large(
        &self,
        bucket: &BucketId,
        name: &Utf8Path,
        content_type: &BzMime,
        mut info: BTreeMap<String, String>,
        source: &dyn RangedSource,
        total: u64,
        part_size: u64,
        options: &TransferOptions,
    ) -> Result<FileInfo, Error> {
        let digest = digest_source(source).await?;
        info.entry(LARGE_FILE_SHA1_KEY.to_owned())
            .or_insert_with(|| digest.hex());

        let started = self
            .start_large_file_with(bucket, name, content_type, &info, &options.cancel)
            .await?;
        let file_id = started.id().clone();
        tracing::debug!(file = %file_id, "started large file upload");

        let plan = plan_parts(total, part_size);
        let tracker = ProgressTracker::new(total, options.progress.clone());
        let mut part_sha1s: Vec<Option<String>> = vec![None; plan.len()];
        let mut first_error: Option<Error> = None;
        let aborted = AtomicBool::new(false);

        {
            let mut uploads = futures::stream::iter(plan.iter().copied().map(|part| {
                let file_id = &file_id;
                let cancel = &options.cancel;
                let aborted = &aborted;
                async move {
                    if aborted.load(Ordering::Relaxed) {
                        return (part, Err(Error::Cancelled));
                    }
                    (part, self.upload_part(file_id, part, source, cancel).await)
                }
            }))
            .buffer_unordered(self.config().upload_connections);

            while let Some((part, outcome)) = uploads.next().await {
                match outcome {
                    Ok(sha1) => {
                        tracker.record(part.length);
                        part_sha1s[(part.number - 1) as usize] = Some(sha1);
                    }
                    Err(error) => {
                        aborted.store(true, Ordering::Relaxed);
                        if first_error.is_none() {
                            first_error = Some(error);
                        }
                    }
                }
            }
        }

        if let Some(error) = first_error {
            tracing::debug!(file = %file_id, "large file upload failed: {error}");
            return Err(interrupted_at(tracker.transferred(), error));
        }

        let part_sha1s: Vec<String> = part_sha1s
            .into_iter()
            .map(|sha| sha.expect("every planned part is acknowledged before finish"))
            .collect();

        let finished = self
            .finish_large_file_with(&file_id, &part_sha1s, &options.cancel)
            .await
            .map_err(|error| interrupted_at(tracker.transferred(), error))?;

        tracing::debug!(file = %file_id, parts = part_sha1s.len(), "finished large file upload");
        Ok(finished)
    }

    /// Upload one planned part, retrying under the policies. Returns the
    /// part's hex digest.
    async fn upload_part(
        &self,
        file: &FileId,
        part: Part,
        source: &dyn RangedSource,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        let body = source.read_at(part.position, part.length).await?;
        let digest = digest_bytes(&body);

        self.run_transfer("b2_upload_part", cancel, || {
            let body = body.clone();
            let digest = &digest;
            Box::pin(async move {
                let _slot = self.uploads.acquire().await;

                let lease = self.lease_part_url(file).await?;
                match self.op_upload_part(&lease, part.number, body, digest).await {
                    Ok(()) => {
                        self.part_urls.checkin(file, lease);
                        Ok(digest.hex())
                    }
                    // The lease is dropped, which evicts the URL.
                    Err(error) => Err(error),
                }
            })
        })
        .await
    }
}
