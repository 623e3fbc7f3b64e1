use std::ops::Range;

/// Archives of at least this many bytes are uploaded in parts.
pub const CHUNK_THRESHOLD_BYTES: u64 = 20 * 1024 * 1024;

/// Size of every multipart part except the last. Kept equal to the threshold;
/// providers such as Cloudflare R2 reject unequal non-trailing parts.
pub const PART_SIZE_BYTES: u64 = CHUNK_THRESHOLD_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPlan {
    Single {
        length: u64,
    },
    Chunked {
        part_size: u64,
        part_count: u64,
        last_part_size: u64,
    },
}

/// One multipart part: 1-based number and byte range within the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpec {
    pub number: i32,
    pub offset: u64,
    pub length: u64,
}

impl PartSpec {
    pub fn range(&self) -> Range<usize> {
        self.offset as usize..(self.offset + self.length) as usize
    }
}

impl TransferPlan {
    pub fn for_size(total: u64) -> Self {
        Self::with_limits(total, CHUNK_THRESHOLD_BYTES, PART_SIZE_BYTES)
    }

    fn with_limits(total: u64, threshold: u64, part_size: u64) -> Self {
        if total < threshold {
            return TransferPlan::Single { length: total };
        }
        let part_count = total.div_ceil(part_size);
        let last_part_size = match total % part_size {
            0 => part_size,
            remainder => remainder,
        };
        TransferPlan::Chunked {
            part_size,
            part_count,
            last_part_size,
        }
    }

    pub fn total_size(&self) -> u64 {
        match *self {
            TransferPlan::Single { length } => length,
            TransferPlan::Chunked {
                part_size,
                part_count,
                last_part_size,
            } => part_size * (part_count - 1) + last_part_size,
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, TransferPlan::Chunked { .. })
    }

    /// Parts in ascending order; empty for a single-shot plan.
    pub fn parts(&self) -> Vec<PartSpec> {
        match *self {
            TransferPlan::Single { .. } => Vec::new(),
            TransferPlan::Chunked {
                part_size,
                part_count,
                last_part_size,
            } => (0..part_count)
                .map(|index| PartSpec {
                    number: (index + 1) as i32,
                    offset: index * part_size,
                    length: if index + 1 == part_count {
                        last_part_size
                    } else {
                        part_size
                    },
                })
                .collect(),
        }
    }
}
