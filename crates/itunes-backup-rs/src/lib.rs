//! Extracts the keybag key-derivation parameters from an encrypted iTunes
//! backup's `Manifest.plist` and renders them as an `$itunes_backup$` hash
//! for hashcat (modes 14700/14800) or John the Ripper.
//!
//! The property list is never decoded: the keybag records are located by
//! scanning the raw file for their four-byte tags.
pub mod error;
pub mod types;
pub mod util;

pub use error::{Error, Result};
pub use types::{ExtractionResult, HashVersion, ManifestHash, ManifestReader};

/// Scans and formats one manifest held in memory.
///
/// This is the whole pipeline for callers that already have the file
/// contents: buffers under 24 bytes fail with [`Error::BufferTooShort`], a
/// manifest without a `SALT`/`ITER`/`WPKY` group fails with
/// [`Error::RecordNotFound`], and the remaining checks are those of
/// [`ManifestHash::format`]. Use [`util::hash_files`] to process files on disk.
pub fn hash_from_bytes(data: &[u8]) -> Result<ManifestHash> {
    ManifestHash::from_bytes(data)
}

#[cfg(test)]
#[test]
#[tracing_test::traced_test]
fn read_manifest() {
    let data = include_bytes!("../fixtures/manifest_v10.plist");

    let reader = ManifestReader::new(data);
    let result = reader.extract().unwrap();
    assert_eq!(result.iteration_count, Some(10000));
    assert_eq!(result.secondary.as_ref().map(|s| s.dpic), Some(10_000_000));

    let hash = hash_from_bytes(data).unwrap();
    assert_eq!(hash.version(), HashVersion::V10);
    assert!(logs_contain("Secondary tier"));
}
