//! Transfer planning.
//!
//! This module contains pure logic for the single-request vs multipart
//! decision and for splitting an object into parts. No I/O operations -
//! just decision making.

use rusty_transfer_common::MAX_PART_SIZE;

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::types::{ByteRange, Operation};

/// One part of a multipart plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpec {
    /// One-based part index.
    pub index: u32,
    /// Byte range within the object.
    pub range: ByteRange,
}

/// Parts of a multipart transfer, in ascending index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPlan {
    parts: Vec<PartSpec>,
    part_size: u64,
}

impl MultipartPlan {
    pub fn parts(&self) -> &[PartSpec] {
        &self.parts
    }

    /// Size of every part but the last.
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }
}

/// Execution plan for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// One request covering the whole object.
    Single { range: ByteRange },
    /// Several ranged requests.
    Multipart(MultipartPlan),
}

impl Plan {
    pub fn kind(&self) -> PlanKind {
        match self {
            Plan::Single { .. } => PlanKind::Single,
            Plan::Multipart(_) => PlanKind::Multipart,
        }
    }

    pub fn part_count(&self) -> u32 {
        match self {
            Plan::Single { .. } => 1,
            Plan::Multipart(plan) => plan.part_count(),
        }
    }
}

/// Strategy chosen by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Single,
    Multipart,
}

/// Determine if an object of `size` bytes needs a multipart transfer.
pub fn needs_multipart(size: u64, config: &TransferConfig) -> bool {
    size > config.multipart_threshold()
}

/// Part size actually used for an object of `size` bytes.
///
/// The configured chunk size grows when the object would otherwise need
/// more than `max_parts` parts.
pub fn effective_part_size(size: u64, chunksize: u64, max_parts: u32) -> u64 {
    let min_for_cap: u64 = size.div_ceil(u64::from(max_parts.max(1)));
    chunksize.max(min_for_cap)
}

/// Split `[0, size)` into contiguous parts of `part_size` bytes.
///
/// The last part may be smaller than `part_size`.
pub fn generate_parts(size: u64, part_size: u64) -> Vec<PartSpec> {
    let mut parts = Vec::with_capacity(size.div_ceil(part_size.max(1)) as usize);
    let mut offset = 0u64;
    let mut index = 1u32;

    while offset < size {
        let length: u64 = std::cmp::min(part_size, size - offset);
        parts.push(PartSpec {
            index,
            range: ByteRange::new(offset, offset + length),
        });
        offset += length;
        index += 1;
    }

    parts
}

/// Plan a transfer of `size` bytes.
///
/// # Arguments
/// * `size` - Total object size in bytes
/// * `operation` - Upload, download, or copy
/// * `config` - Validated transfer settings
///
/// # Returns
/// `Plan::Single` for objects at or below the threshold (including empty
/// objects), otherwise a `Plan::Multipart` whose parts exactly cover `[0, size)`.
pub fn plan(size: u64, operation: Operation, config: &TransferConfig) -> Result<Plan, TransferError> {
    if !needs_multipart(size, config) {
        return Ok(Plan::Single {
            range: ByteRange::new(0, size),
        });
    }

    let part_size: u64 =
        effective_part_size(size, config.multipart_chunksize(), config.max_parts());

    // Ranged GETs have no per-part limit; upload and copy parts do.
    if operation != Operation::Download && part_size > MAX_PART_SIZE {
        return Err(TransferError::InvalidRequest {
            message: format!(
                "object of {} bytes needs parts of {} bytes, above the {} byte part limit",
                size, part_size, MAX_PART_SIZE
            ),
        });
    }

    Ok(Plan::Multipart(MultipartPlan {
        parts: generate_parts(size, part_size),
        part_size,
    }))
}
