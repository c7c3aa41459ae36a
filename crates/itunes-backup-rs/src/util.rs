use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::types::ManifestHash;

pub type Tag = [u8; TAG_LEN];

pub const TAG_LEN: usize = 4;
/// Tag followed by a big-endian u32 payload length
pub const RECORD_HEADER_LEN: usize = TAG_LEN + 4;
/// Anything shorter cannot hold a keybag worth scanning
pub const MIN_MANIFEST_LEN: usize = 24;
/// Maximum distance between the first and last tag of a record group
pub const MAX_PLIST_SEARCH_DISTANCE: usize = 256;

pub const SALT: &Tag = b"SALT";
pub const ITER: &Tag = b"ITER";
pub const WPKY: &Tag = b"WPKY";
pub const DPIC: &Tag = b"DPIC";
pub const DPSL: &Tag = b"DPSL";

pub fn tag_name(tag: &'static Tag) -> &'static str {
    std::str::from_utf8(tag).unwrap_or("????")
}

/// Returns the offset of the first occurrence of `tag` at or after `from`.
pub fn find_tag(data: &[u8], tag: &Tag, from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(TAG_LEN)
        .position(|window| window == tag)
        .map(|pos| pos + from)
}

/// Locates the first group of `tags` occurring in order, where the last tag
/// sits less than `window` bytes after the first one.
///
/// Each tag is searched strictly after the previous one. When a group is
/// found but spans too far, the search restarts just past its last tag, so a
/// closer group later in the buffer still matches. Returns `None` as soon as
/// any tag of the group can no longer be found, or when the last tag has no
/// room left for its record header.
///
/// `tags` must not be empty.
#[tracing::instrument(skip(data), fields(len = data.len()))]
pub fn find_tag_group<const N: usize>(
    data: &[u8],
    tags: [&'static Tag; N],
    window: usize,
) -> Option<[usize; N]> {
    let mut cursor = 0;
    loop {
        let mut offsets = [0usize; N];
        let mut from = cursor;
        for (offset, tag) in offsets.iter_mut().zip(tags) {
            *offset = find_tag(data, tag, from)?;
            trace!("{} at {:#x}", tag_name(tag), *offset);
            from = *offset + 1;
        }

        let (first, last) = (offsets[0], offsets[N - 1]);
        if data.len() - last < RECORD_HEADER_LEN {
            trace!("No room for a record header at {:#x}", last);
            return None;
        }
        if last - first < window {
            return Some(offsets);
        }

        trace!(
            "Group spans {} bytes ({:#x}..{:#x}), rescanning",
            last - first,
            first,
            last
        );
        cursor = last + 1;
    }
}

/// Reads the length-prefixed payload of the record whose tag starts at `offset`.
pub fn read_record<'a>(data: &'a [u8], tag: &'static Tag, offset: usize) -> Result<&'a [u8]> {
    let start = offset + RECORD_HEADER_LEN;
    let len_bytes: [u8; 4] = data
        .get(offset + TAG_LEN..start)
        .and_then(|b| b.try_into().ok())
        .ok_or(Error::Truncated {
            tag: tag_name(tag),
            declared: RECORD_HEADER_LEN,
            available: data.len().saturating_sub(offset),
        })?;
    let declared = u32::from_be_bytes(len_bytes) as usize;
    let available = data.len().saturating_sub(start);

    debug!("{} record: {} bytes at {:#x}", tag_name(tag), declared, start);

    start
        .checked_add(declared)
        .and_then(|end| data.get(start..end))
        .ok_or(Error::Truncated {
            tag: tag_name(tag),
            declared,
            available,
        })
}

/// Decodes a big-endian unsigned integer payload of 1 to 8 bytes.
pub fn decode_be_uint(tag: &'static Tag, payload: &[u8]) -> Result<u64> {
    if payload.is_empty() || payload.len() > 8 {
        return Err(Error::InvalidInteger {
            tag: tag_name(tag),
            len: payload.len(),
        });
    }
    Ok(payload
        .iter()
        .fold(0u64, |acc, &byte| (acc << 8) | byte as u64))
}

/// Hashes every manifest in parallel. Results keep the order of `paths`; a
/// failing file does not affect the others.
pub fn hash_files<P: AsRef<Path> + Sync>(paths: &[P]) -> Vec<(PathBuf, Result<ManifestHash>)> {
    paths
        .par_iter()
        .map(|path| {
            let path = path.as_ref();
            let result = ManifestHash::read_from_path(path);
            if let Err(e) = &result {
                warn!("{}: {}", path.display(), e);
            }
            (path.to_path_buf(), result)
        })
        .collect()
}
