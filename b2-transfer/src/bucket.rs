use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fmt, ops::Deref};

use api_kit::Secret;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::client::Session;
use crate::errors::{EnvelopeExt as _, Error};

/// How long a bucket-name lookup stays cached.
const BUCKET_CACHE_TTL: Duration = Duration::from_secs(300);

/// The service-assigned identifier of a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct BucketId(Arc<str>);

impl BucketId {
    /// Wrap a known bucket id.
    pub fn new<S>(id: S) -> Self
    where
        S: Into<String>,
    {
        BucketId(Arc::from(id.into()))
    }
}

impl From<String> for BucketId {
    fn from(value: String) -> Self {
        BucketId(value.into())
    }
}

impl From<BucketId> for String {
    fn from(value: BucketId) -> Self {
        value.0.deref().to_owned()
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Bucket> for BucketId {
    fn from(value: Bucket) -> Self {
        value.bucket_id
    }
}

impl AsRef<BucketId> for BucketId {
    fn as_ref(&self) -> &BucketId {
        self
    }
}

/// A bucket as returned by `b2_list_buckets`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    bucket_name: String,
    bucket_id: BucketId,
    bucket_type: BucketType,
}

impl Bucket {
    /// The bucket name.
    pub fn name(&self) -> &str {
        &self.bucket_name
    }

    /// The bucket id.
    pub fn id(&self) -> &BucketId {
        &self.bucket_id
    }

    /// The bucket visibility class.
    pub fn kind(&self) -> &BucketType {
        &self.bucket_type
    }
}

impl AsRef<BucketId> for Bucket {
    fn as_ref(&self) -> &BucketId {
        &self.bucket_id
    }
}

/// Which buckets a listing should return.
#[derive(Debug, Clone)]
pub enum BucketSelector {
    /// Every bucket visible to the key.
    All,
    /// A single bucket by id.
    ById(BucketId),
    /// A single bucket by name.
    ByName(String),
}

impl From<BucketId> for BucketSelector {
    fn from(value: BucketId) -> Self {
        BucketSelector::ById(value)
    }
}

impl From<String> for BucketSelector {
    fn from(value: String) -> Self {
        BucketSelector::ByName(value)
    }
}

impl From<&str> for BucketSelector {
    fn from(value: &str) -> Self {
        BucketSelector::ByName(value.to_owned())
    }
}

impl From<()> for BucketSelector {
    fn from(_: ()) -> Self {
        BucketSelector::All
    }
}

/// The visibility class of a bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BucketType {
    /// Files require an authorization token to read.
    AllPrivate,
    /// Files are readable by anybody.
    AllPublic,
    /// A backup snapshot bucket.
    Snapshot,
}

#[derive(Debug, Clone)]
pub(crate) struct CachedBucket {
    bucket: Bucket,
    fetched: Instant,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct BucketListBody {
    account_id: Secret,
    #[serde(skip_serializing_if = "Option::is_none")]
    bucket_id: Option<BucketId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bucket_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bucket_types: Option<Vec<BucketType>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketListResponse {
    buckets: Vec<Bucket>,
}

impl Session {
    /// List buckets visible to this key, optionally narrowed to one bucket
    /// and filtered by type.
    #[tracing::instrument(skip_all)]
    pub async fn list_buckets<L: Into<BucketSelector>>(
        &self,
        select: L,
        filter: Option<&[BucketType]>,
    ) -> Result<Vec<Bucket>, Error> {
        let select = select.into();
        let cancel = CancellationToken::new();

        self.run_transfer("b2_list_buckets", &cancel, || {
            let select = select.clone();
            Box::pin(async move { self.op_list_buckets(select, filter).await })
        })
        .await
    }

    /// Look up a bucket by name, with a short-lived cache in front of the
    /// listing call.
    #[tracing::instrument(skip(self))]
    pub async fn bucket_by_name(&self, name: &str) -> Result<Bucket, Error> {
        if let Some(cached) = self.buckets.get(name) {
            if cached.fetched.elapsed() < BUCKET_CACHE_TTL {
                return Ok(cached.bucket.clone());
            }
        }

        let mut buckets = self
            .list_buckets(BucketSelector::ByName(name.to_owned()), None)
            .await?;

        let bucket = buckets
            .pop()
            .ok_or_else(|| Error::UnknownBucket(name.to_owned()))?;

        self.buckets.insert(
            name.to_owned(),
            CachedBucket {
                bucket: bucket.clone(),
                fetched: Instant::now(),
            },
        );

        Ok(bucket)
    }

    async fn op_list_buckets(
        &self,
        select: BucketSelector,
        filter: Option<&[BucketType]>,
    ) -> Result<Vec<Bucket>, Error> {
        let auth = self.require_authorization()?;

        let (bucket_id, bucket_name) = match select {
            BucketSelector::All => (None, None),
            BucketSelector::ById(id) => (Some(id), None),
            BucketSelector::ByName(name) => (None, Some(name)),
        };

        let body = BucketListBody {
            account_id: auth.account_id.clone(),
            bucket_id,
            bucket_name,
            bucket_types: filter.map(|f| f.to_vec()),
        };

        let response: BucketListResponse = self
            .post_api("b2_list_buckets", &body)
            .await?
            .deserialize("b2_list_buckets")
            .await?;

        Ok(response.buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_list_body_omits_empty_selectors() {
        let body = BucketListBody {
            account_id: Secret::from("acct"),
            bucket_id: None,
            bucket_name: Some("media".into()),
            bucket_types: None,
        };

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"accountId": "acct", "bucketName": "media"})
        );
    }

    #[test]
    fn bucket_parses_from_wire_shape() {
        let bucket: Bucket = serde_json::from_value(serde_json::json!({
            "bucketId": "b-1",
            "bucketName": "media",
            "bucketType": "allPrivate",
        }))
        .unwrap();

        assert_eq!(bucket.name(), "media");
        assert_eq!(bucket.id(), &BucketId::new("b-1"));
        assert!(matches!(bucket.kind(), BucketType::AllPrivate));
    }
}
