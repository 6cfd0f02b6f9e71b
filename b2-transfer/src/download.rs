//! Download endpoints and the download orchestrator.

use std::sync::atomic::{AtomicBool, Ordering};

use api_kit::uri::UriExtension as _;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::StreamExt as _;
use http::{Method, Uri};
use http_body_util::BodyExt as _;
use hyperdriver::Body;
use sha1::{Digest as _, Sha1};
use tokio_util::sync::CancellationToken;

use crate::application::Authorization;
use crate::client::{Session, TransferOptions};
use crate::errors::{interrupted_at, EnvelopeExt as _, Error};
use crate::file::FileId;
use crate::io::RangedSink;
use crate::parts::{effective_cutoff, effective_part_size, plan_parts, Part};
use crate::progress::ProgressTracker;

const FILE_URL_BASE: &str = "file";

/// Which file a download addresses.
#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    Id(&'a FileId),
    Name {
        bucket: &'a str,
        file: &'a Utf8Path,
    },
}

/// The URL a target is fetched from.
fn download_file_url(auth: &Authorization, target: &Target<'_>) -> Result<Uri, Error> {
    match target {
        Target::Name { bucket, file } => {
            let mut path = Utf8PathBuf::from(FILE_URL_BASE);
            path.push(bucket);
            path.extend(*file);

            Ok(auth.download_url().clone().join(path.as_str()))
        }
        Target::Id(id) => {
            let url = auth
                .download_url()
                .clone()
                .join(format!("{}/b2_download_file_by_id", crate::B2_API_PATH));
            Ok(url.append_query(&[("fileId", id.as_str())])?)
        }
    }
}

/// Whether a `X-Bz-Content-Sha1` header value names a digest this side can
/// check. Large files advertise `none` or an `unverified:` client value.
fn checkable_sha1(value: &str) -> Option<&str> {
    match value {
        "none" => None,
        value if value.starts_with("unverified:") => None,
        value => Some(value),
    }
}

impl Session {
    /// Download a file by bucket and name into `sink`. Returns the number
    /// of bytes the file holds.
    #[tracing::instrument(skip(self, sink, options))]
    pub async fn download_by_name(
        &self,
        bucket: &str,
        file: &Utf8Path,
        sink: &dyn RangedSink,
        options: &TransferOptions,
    ) -> Result<u64, Error> {
        self.download_inner(Target::Name { bucket, file }, sink, options)
            .await
    }

    /// Download a file by id into `sink`. Returns the number of bytes the
    /// file holds.
    #[tracing::instrument(skip(self, sink, options), fields(%file))]
    pub async fn download_by_id(
        &self,
        file: &FileId,
        sink: &dyn RangedSink,
        options: &TransferOptions,
    ) -> Result<u64, Error> {
        self.download_inner(Target::Id(file), sink, options).await
    }

    async fn download_inner(
        &self,
        target: Target<'_>,
        sink: &dyn RangedSink,
        options: &TransferOptions,
    ) -> Result<u64, Error> {
        let auth = self.ensure_connected().await?;

        let part_size = effective_part_size(
            self.config().download_part_size,
            auth.recommended_part_size(),
            auth.minimum_part_size(),
        );
        let cutoff = effective_cutoff(
            self.config().download_cutoff_size,
            part_size,
            auth.minimum_part_size(),
        );

        let total = self.probe(&target, &options.cancel).await?;
        let url = download_file_url(&auth, &target)?;
        let tracker = ProgressTracker::new(total, options.progress.clone());

        if total < cutoff {
            self.run_transfer("b2_download_file", &options.cancel, || {
                let url = url.clone();
                let tracker = &tracker;
                Box::pin(async move {
                    let _slot = self.downloads.acquire().await;
                    // A retried attempt rewrites the sink from the start.
                    tracker.reset();
                    self.op_download_direct(&url, sink, tracker).await
                })
            })
            .await
            .map_err(|error| interrupted_at(tracker.transferred(), error))?;

            return Ok(total);
        }

        let plan = plan_parts(total, part_size);
        tracing::debug!(parts = plan.len(), total, "ranged download");

        let mut first_error: Option<Error> = None;
        let aborted = AtomicBool::new(false);

        {
            let mut reads = futures::stream::iter(plan.iter().copied().map(|part| {
                let url = &url;
                let cancel = &options.cancel;
                let aborted = &aborted;
                let tracker = &tracker;
                async move {
                    if aborted.load(Ordering::Relaxed) {
                        return (part, Err(Error::Cancelled));
                    }
                    let outcome = self
                        .download_part(url, part, sink, tracker, cancel)
                        .await;
                    (part, outcome)
                }
            }))
            .buffer_unordered(self.config().download_connections);

            while let Some((part, outcome)) = reads.next().await {
                match outcome {
                    Ok(()) => tracing::trace!(part = part.number, "part downloaded"),
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
            return Err(interrupted_at(tracker.transferred(), error));
        }

        Ok(total)
    }

    /// Learn the length of the target without transferring its content: a
    /// `HEAD` probe for named files, the file-info call for ids.
    async fn probe(&self, target: &Target<'_>, cancel: &CancellationToken) -> Result<u64, Error> {
        match target {
            Target::Id(id) => {
                let info = self.get_file_info_with(id, cancel).await?;
                Ok(info.content_length())
            }
            Target::Name { .. } => {
                self.run_transfer("b2_download_head", cancel, || {
                    Box::pin(async move {
                        let auth = self.require_authorization()?;
                        let url = download_file_url(&auth, target)?;

                        let request = http::Request::builder()
                            .method(Method::HEAD)
                            .uri(url)
                            .body(Body::empty())?;

                        let response = self.execute("b2_download_head", request).await?;
                        let response = response.error_for_status().await?;

                        response
                            .headers()
                            .get(http::header::CONTENT_LENGTH)
                            .and_then(|value| value.to_str().ok())
                            .and_then(|value| value.parse().ok())
                            .ok_or(Error::MissingLength {
                                op: "b2_download_head",
                            })
                    })
                })
                .await
            }
        }
    }

    /// Stream a whole file into the sink, verifying the advertised digest.
    async fn op_download_direct(
        &self,
        url: &Uri,
        sink: &dyn RangedSink,
        tracker: &ProgressTracker,
    ) -> Result<(), Error> {
        let request = http::Request::builder()
            .method(Method::GET)
            .uri(url.clone())
            .body(Body::empty())?;

        let response = self
            .execute("b2_download_file", request)
            .await?
            .check("b2_download_file")
            .await?;

        let expected = response
            .headers()
            .get("x-bz-content-sha1")
            .and_then(|value| value.to_str().ok())
            .and_then(checkable_sha1)
            .map(str::to_owned);
        let full_body = response.status() == http::StatusCode::OK;

        let mut hasher = (full_body && expected.is_some()).then(Sha1::new);
        let mut offset = 0u64;

        let mut stream = response.into_body().into_data_stream();
        while let Some(chunk) = stream.next().await {
            let chunk: Bytes = chunk.map_err(Error::Body)?;
            if let Some(hasher) = &mut hasher {
                hasher.update(&chunk);
            }

            let length = chunk.len() as u64;
            sink.write_at(offset, chunk).await?;
            offset += length;
            tracker.record(length);
        }

        if let (Some(hasher), Some(expected)) = (hasher, expected) {
            let actual = hex::encode(hasher.finalize());
            if actual != expected {
                return Err(Error::Digest {
                    op: "b2_download_file",
                    expected,
                    actual,
                });
            }
        }

        Ok(())
    }

    /// Fetch one planned range and write it at its position, retrying under
    /// the policies.
    async fn download_part(
        &self,
        url: &Uri,
        part: Part,
        sink: &dyn RangedSink,
        tracker: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let body = self
            .run_transfer("b2_download_range", cancel, || {
                let url = url.clone();
                Box::pin(async move {
                    let _slot = self.downloads.acquire().await;
                    self.op_download_range(&url, part).await
                })
            })
            .await?;

        sink.write_at(part.position, body).await?;
        tracker.record(part.length);
        Ok(())
    }

    /// Fetch the bytes of one range.
    ///
    /// Ranged responses advertise the whole file's digest, so no check is
    /// possible here; integrity of ranged downloads rests on TLS and the
    /// part lengths.
    async fn op_download_range(&self, url: &Uri, part: Part) -> Result<Bytes, Error> {
        let request = http::Request::builder()
            .method(Method::GET)
            .uri(url.clone())
            .header(http::header::RANGE, part.range_header())
            .body(Body::empty())?;

        let response = self
            .execute("b2_download_range", request)
            .await?
            .check("b2_download_range")
            .await?;

        let body = response.bytes().await.map_err(Error::Body)?;

        if body.len() as u64 != part.length {
            return Err(Error::UnexpectedLength {
                op: "b2_download_range",
                expected: part.length,
                received: body.len() as u64,
            });
        }

        Ok(body)
    }
}
