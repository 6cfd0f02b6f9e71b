use serde::{Deserialize, Serialize};

/// Tunables for a [`Session`](crate::Session).
///
/// All sizes are in bytes; a size of `0` means "use the account's
/// recommended part size". Part sizes are floored at the account's absolute
/// minimum part size when the session computes effective values.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Retries granted to each recovery policy (authentication refresh and
    /// digest mismatch).
    pub retry_count: u32,

    /// Maximum in-flight upload requests (single-shot uploads and large
    /// file parts share this limit).
    pub upload_connections: usize,

    /// Maximum in-flight download requests.
    pub download_connections: usize,

    /// Threshold above which uploads switch to the large-file protocol.
    pub upload_cutoff_size: u64,

    /// Planned size of large-file parts.
    pub upload_part_size: u64,

    /// Threshold above which downloads switch to ranged parallel reads.
    pub download_cutoff_size: u64,

    /// Planned size of ranged download reads.
    pub download_part_size: u64,

    /// Service-injected fault marker, forwarded as `X-Bz-Test-Mode`.
    pub test_mode: Option<TestMode>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            retry_count: 3,
            upload_connections: 1,
            download_connections: 1,
            upload_cutoff_size: 0,
            upload_part_size: 0,
            download_cutoff_size: 0,
            download_part_size: 0,
            test_mode: None,
        }
    }
}

impl TransferConfig {
    /// Clamp values that have hard lower bounds.
    pub(crate) fn normalized(mut self) -> Self {
        self.upload_connections = self.upload_connections.max(1);
        self.download_connections = self.download_connections.max(1);
        self
    }
}

/// Fault injection markers understood by the B2 service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    /// The service fails a fraction of uploads.
    FailSomeUploads,

    /// The service expires a fraction of account authorization tokens.
    ExpireSomeAccountAuthorizationTokens,

    /// The service answers as if a usage cap were reached.
    ForceCapExceeded,
}

impl TestMode {
    /// The wire value sent in `X-Bz-Test-Mode`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TestMode::FailSomeUploads => "fail_some_uploads",
            TestMode::ExpireSomeAccountAuthorizationTokens => {
                "expire_some_account_authorization_tokens"
            }
            TestMode::ForceCapExceeded => "force_cap_exceeded",
        }
    }
}
