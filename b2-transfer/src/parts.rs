//! Part planning for chunked transfers.

/// One contiguous byte range of a planned transfer.
///
/// Part numbers are 1-based, matching the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    /// 1-based part number.
    pub number: u32,
    /// Byte offset of this part in the source.
    pub position: u64,
    /// Length of this part in bytes; every part except the last spans the
    /// full planned part size.
    pub length: u64,
}

impl Part {
    /// Render the closed HTTP `Range` header for this part.
    pub(crate) fn range_header(&self) -> String {
        format!(
            "bytes={}-{}",
            self.position,
            self.position + self.length - 1
        )
    }
}

/// Split `[0, total)` into contiguous parts of `part_size` bytes, with a
/// possibly short final part.
pub(crate) fn plan_parts(total: u64, part_size: u64) -> Vec<Part> {
    if total == 0 || part_size == 0 {
        return Vec::new();
    }

    let count = total.div_ceil(part_size);
    (0..count)
        .map(|index| {
            let position = index * part_size;
            Part {
                number: (index + 1) as u32,
                position,
                length: part_size.min(total - position),
            }
        })
        .collect()
}

/// The part size transfers are planned with: the account's recommended size
/// when unconfigured, otherwise the configured size floored at the
/// account's absolute minimum.
pub(crate) fn effective_part_size(configured: u64, recommended: u64, minimum: u64) -> u64 {
    if configured == 0 {
        recommended
    } else {
        configured.max(minimum)
    }
}

/// The threshold above which a transfer switches to its chunked path: the
/// effective part size when unconfigured, otherwise the configured cutoff
/// floored at the account's absolute minimum.
pub(crate) fn effective_cutoff(configured: u64, part_size: u64, minimum: u64) -> u64 {
    if configured == 0 {
        part_size
    } else {
        configured.max(minimum)
    }
}
