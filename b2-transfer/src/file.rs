use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::{fmt, ops::Deref};

use api_kit::Secret;
use camino::{Utf8Path, Utf8PathBuf};
use futures::{Stream, StreamExt as _};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::bucket::BucketId;
use crate::client::Session;
use crate::errors::{EnvelopeExt as _, Error};

pub use self::mime::BzMime;

/// The service-assigned identifier of a file version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct FileId(Arc<str>);

impl FileId {
    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for FileId {
    fn from(value: String) -> Self {
        FileId(value.into())
    }
}

impl From<&str> for FileId {
    fn from(value: &str) -> Self {
        FileId(value.into())
    }
}

impl From<FileId> for String {
    fn from(value: FileId) -> Self {
        value.0.deref().to_owned()
    }
}

/// What a file entry represents.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// An unfinished large file.
    Start,
    /// A regular uploaded file.
    Upload,
    /// A hide marker shadowing older versions.
    Hide,
    /// A virtual folder entry from a delimited listing.
    Folder,
    /// A server-side copy.
    Copy,
}

/// A file version as returned by the upload, finish, info, and listing
/// calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    account_id: Secret,
    action: Action,
    bucket_id: BucketId,
    content_length: u64,
    content_sha1: Option<String>,
    content_type: BzMime,
    file_id: FileId,
    file_name: Utf8PathBuf,
    #[serde(default)]
    file_info: BTreeMap<String, String>,
    upload_timestamp: u64,
}

impl FileInfo {
    /// The file name, as a UTF-8 path.
    pub fn path(&self) -> &Utf8Path {
        &self.file_name
    }

    /// The file version id.
    pub fn id(&self) -> &FileId {
        &self.file_id
    }

    /// The bucket holding this file.
    pub fn bucket(&self) -> &BucketId {
        &self.bucket_id
    }

    /// What this entry represents.
    pub fn action(&self) -> Action {
        self.action
    }

    /// The file length in bytes.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// The whole-file SHA-1, when the service knows one. Large files report
    /// `none` on the wire, which surfaces here as `None`.
    pub fn content_sha1(&self) -> Option<&str> {
        match self.content_sha1.as_deref() {
            None | Some("none") => None,
            Some(sha) => Some(sha.strip_prefix("unverified:").unwrap_or(sha)),
        }
    }

    /// The declared content type.
    pub fn content_type(&self) -> &BzMime {
        &self.content_type
    }

    /// The custom `X-Bz-Info-*` metadata stored with the file.
    pub fn info(&self) -> &BTreeMap<String, String> {
        &self.file_info
    }

    /// Milliseconds since the epoch at which the file was uploaded.
    pub fn uploaded_at(&self) -> u64 {
        self.upload_timestamp
    }
}

/// One page of a file-name listing, with the continuation token for the
/// next page.
#[derive(Debug, Clone)]
pub struct FileNamePage {
    /// The files in this page.
    pub files: Vec<FileInfo>,
    /// Pass as `start_file_name` to continue the listing; `None` when the
    /// listing is complete.
    pub next_file_name: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileListBody {
    bucket_id: BucketId,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_file_name: Option<Utf8PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_file_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delimiter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    files: Vec<FileInfo>,
    next_file_name: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetFileInfoBody<'f> {
    file_id: &'f FileId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileDeleteBody<'f> {
    file_name: &'f Utf8Path,
    file_id: &'f FileId,
}

impl Session {
    /// Fetch the metadata of one file version.
    #[tracing::instrument(skip(self), fields(%file))]
    pub async fn get_file_info(&self, file: &FileId) -> Result<FileInfo, Error> {
        self.get_file_info_with(file, &CancellationToken::new())
            .await
    }

    pub(crate) async fn get_file_info_with(
        &self,
        file: &FileId,
        cancel: &CancellationToken,
    ) -> Result<FileInfo, Error> {
        self.run_transfer("b2_get_file_info", cancel, || {
            Box::pin(async move {
                self.post_api("b2_get_file_info", &GetFileInfoBody { file_id: file })
                    .await?
                    .deserialize("b2_get_file_info")
                    .await
            })
        })
        .await
    }

    /// Fetch one page of file names in a bucket.
    #[tracing::instrument(skip_all, fields(bucket = %bucket))]
    pub async fn list_file_names_page(
        &self,
        bucket: &BucketId,
        start_file_name: Option<Utf8PathBuf>,
        max_file_count: Option<usize>,
        prefix: Option<String>,
        delimiter: Option<String>,
    ) -> Result<FileNamePage, Error> {
        let body = FileListBody {
            bucket_id: bucket.clone(),
            start_file_name,
            max_file_count,
            prefix,
            delimiter,
        };

        let cancel = CancellationToken::new();
        let response: FileListResponse = self
            .run_transfer("b2_list_file_names", &cancel, || {
                let body = body.clone();
                Box::pin(async move {
                    self.post_api("b2_list_file_names", &body)
                        .await?
                        .deserialize("b2_list_file_names")
                        .await
                })
            })
            .await?;

        Ok(FileNamePage {
            files: response.files,
            next_file_name: response.next_file_name,
        })
    }

    /// Lazily iterate every file name in a bucket, fetching one page at a
    /// time and carrying the continuation token between pages.
    pub fn list_file_names<'s>(
        &'s self,
        bucket: &'s BucketId,
        prefix: Option<String>,
    ) -> impl Stream<Item = Result<FileInfo, Error>> + 's {
        struct PageState {
            next: Option<Utf8PathBuf>,
            buffered: VecDeque<FileInfo>,
            exhausted: bool,
        }

        let state = PageState {
            next: None,
            buffered: VecDeque::new(),
            exhausted: false,
        };

        futures::stream::try_unfold(state, move |mut state| {
            let prefix = prefix.clone();
            async move {
                loop {
                    if let Some(file) = state.buffered.pop_front() {
                        return Ok(Some((file, state)));
                    }
                    if state.exhausted {
                        return Ok(None);
                    }

                    let page = self
                        .list_file_names_page(
                            bucket,
                            state.next.take(),
                            Some(1000),
                            prefix.clone(),
                            None,
                        )
                        .await?;

                    state.buffered.extend(page.files);
                    match page.next_file_name {
                        Some(next) => state.next = Some(next),
                        None => state.exhausted = true,
                    }
                }
            }
        })
    }

    /// Delete one file version.
    #[tracing::instrument(skip_all, fields(%name))]
    pub async fn delete_file_version(&self, name: &Utf8Path, id: &FileId) -> Result<(), Error> {
        let cancel = CancellationToken::new();
        self.run_transfer("b2_delete_file_version", &cancel, || {
            Box::pin(async move {
                self.post_api(
                    "b2_delete_file_version",
                    &FileDeleteBody {
                        file_name: name,
                        file_id: id,
                    },
                )
                .await?
                .check("b2_delete_file_version")
                .await?;
                Ok(())
            })
        })
        .await
    }

    /// Delete every version of the file with this exact name, however many
    /// listing pages it takes to find them.
    #[tracing::instrument(skip(self, bucket), fields(bucket = %bucket.as_ref()))]
    pub async fn delete_file<B: AsRef<BucketId>>(
        &self,
        bucket: B,
        name: &Utf8Path,
    ) -> Result<(), Error> {
        let bucket = bucket.as_ref();

        // The listing is keyed by prefix, so it also surfaces names that
        // merely extend `name`; only exact matches are swept.
        let mut files = std::pin::pin!(self.list_file_names(bucket, Some(name.to_string())));

        let mut deleted = 0usize;
        while let Some(file) = files.next().await {
            let file = file?;
            if file.path() != name {
                continue;
            }

            tracing::trace!(id = %file.id(), "deleting file version");
            self.delete_file_version(file.path(), file.id()).await?;
            deleted += 1;
        }

        if deleted == 0 {
            tracing::warn!("no files found to delete");
        }

        Ok(())
    }
}

mod mime {

    use std::fmt;
    use std::str::FromStr;

    use serde::{de, ser};
    use thiserror::Error;

    /// The string is not a MIME type or a B2 pseudo-type.
    #[derive(Debug, Clone, Error)]
    #[error("Invalid MIME type: {0}")]
    pub struct Invalid(String);

    /// A content type as B2 understands it: a real MIME type, or one of the
    /// service's pseudo-types.
    #[derive(Debug, Clone)]
    pub enum BzMime {
        /// Let the service sniff the type from the file extension.
        Auto,
        /// The hide-marker pseudo-type.
        Hide,
        /// A concrete MIME type.
        Mime(mime::Mime),
        /// A type the `mime` crate cannot parse but the service stored.
        Custom(String),
    }

    impl fmt::Display for BzMime {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                BzMime::Auto => write!(f, "b2/x-auto"),
                BzMime::Hide => write!(f, "application/x-bz-hide-marker"),
                BzMime::Mime(mime) => write!(f, "{}", mime),
                BzMime::Custom(s) => write!(f, "{}", s),
            }
        }
    }

    impl FromStr for BzMime {
        type Err = Invalid;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s {
                "application/x-bz-hide-marker" => return Ok(BzMime::Hide),
                "b2/x-auto" => return Ok(BzMime::Auto),
                _ => {}
            }

            if let Ok(mime) = mime::Mime::from_str(s) {
                return Ok(BzMime::Mime(mime));
            }

            if s.contains('/') {
                return Ok(BzMime::Custom(s.into()));
            }

            Err(Invalid(s.into()))
        }
    }

    impl ser::Serialize for BzMime {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            serializer.serialize_str(&self.to_string())
        }
    }

    impl<'de> de::Deserialize<'de> for BzMime {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            struct Visitor;

            impl<'de> de::Visitor<'de> for Visitor {
                type Value = BzMime;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("a MIME type string")
                }

                fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
                where
                    E: de::Error,
                {
                    BzMime::from_str(v).map_err(de::Error::custom)
                }
            }

            deserializer.deserialize_str(Visitor)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn pseudo_types_round_trip() {
            assert_eq!(BzMime::Auto.to_string(), "b2/x-auto");
            assert!(matches!("b2/x-auto".parse(), Ok(BzMime::Auto)));
            assert!(matches!(
                "application/x-bz-hide-marker".parse(),
                Ok(BzMime::Hide)
            ));
        }

        #[test]
        fn real_mime_types_parse() {
            assert!(matches!("text/plain".parse(), Ok(BzMime::Mime(_))));
            assert!("not a mime".parse::<BzMime>().is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn file_info_value(name: &str, sha1: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "accountId": "acct",
            "action": "upload",
            "bucketId": "b-1",
            "contentLength": 10,
            "contentSha1": sha1,
            "contentType": "text/plain",
            "fileId": "f-1",
            "fileName": name,
            "fileInfo": {"purpose": "test"},
            "uploadTimestamp": 1_700_000_000_000u64,
        })
    }

    #[test]
    fn file_info_parses_the_wire_shape() {
        let info: FileInfo =
            serde_json::from_value(file_info_value("docs/readme.txt", "abc123".into())).unwrap();

        assert_eq!(info.path(), Utf8Path::new("docs/readme.txt"));
        assert_eq!(info.id(), &FileId::from("f-1"));
        assert_eq!(info.content_length(), 10);
        assert_eq!(info.content_sha1(), Some("abc123"));
        assert_eq!(info.info().get("purpose").map(String::as_str), Some("test"));
    }

    #[test]
    fn large_file_sha1_markers_are_not_digests() {
        let info: FileInfo =
            serde_json::from_value(file_info_value("big.bin", "none".into())).unwrap();
        assert_eq!(info.content_sha1(), None);

        let info: FileInfo =
            serde_json::from_value(file_info_value("big.bin", "unverified:abc123".into())).unwrap();
        assert_eq!(info.content_sha1(), Some("abc123"));
    }
}
