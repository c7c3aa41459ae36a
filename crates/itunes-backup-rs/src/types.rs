use std::fmt;
use std::path::Path;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::util::{
    decode_be_uint, find_tag_group, read_record, DPIC, DPSL, ITER, MAX_PLIST_SEARCH_DISTANCE,
    MIN_MANIFEST_LEN, SALT, WPKY,
};

pub const WPKY_LEN: usize = 40;
pub const SALT_LEN: usize = 20;
pub const DPSL_LEN: usize = 20;

const HASH_PREFIX: &str = "$itunes_backup$";

/// Key-derivation fields of the keybag's first tier
#[derive(Clone, PartialEq, Eq)]
pub struct PrimaryTier {
    pub wpky: Vec<u8>,
    pub salt: Vec<u8>,
    pub iteration_count: u64,
}

/// Second key-derivation stage, present in iOS 10.2+ backups
#[derive(Clone, PartialEq, Eq)]
pub struct SecondaryTier {
    pub dpic: u64,
    pub dpsl: Vec<u8>,
}

/// Everything the scanner recovered from one manifest. Fields are left
/// `None` when the records could not be located.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ExtractionResult {
    pub wpky: Option<Vec<u8>>,
    pub salt: Option<Vec<u8>>,
    pub iteration_count: Option<u64>,
    pub secondary: Option<SecondaryTier>,
}

impl From<PrimaryTier> for ExtractionResult {
    fn from(primary: PrimaryTier) -> Self {
        Self {
            wpky: Some(primary.wpky),
            salt: Some(primary.salt),
            iteration_count: Some(primary.iteration_count),
            secondary: None,
        }
    }
}

fn hex_opt(v: &Option<Vec<u8>>) -> Option<String> {
    v.as_ref().map(hex::encode)
}

impl fmt::Debug for PrimaryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryTier")
            .field("wpky", &hex::encode(&self.wpky))
            .field("salt", &hex::encode(&self.salt))
            .field("iteration_count", &self.iteration_count)
            .finish()
    }
}

impl fmt::Debug for SecondaryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryTier")
            .field("dpic", &self.dpic)
            .field("dpsl", &hex::encode(&self.dpsl))
            .finish()
    }
}

impl fmt::Debug for ExtractionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionResult")
            .field("wpky", &hex_opt(&self.wpky))
            .field("salt", &hex_opt(&self.salt))
            .field("iteration_count", &self.iteration_count)
            .field("secondary", &self.secondary)
            .finish()
    }
}

/// Scans a raw `Manifest.plist` for keybag records without decoding the
/// property list itself.
pub struct ManifestReader<'a> {
    data: &'a [u8],
}

impl<'a> ManifestReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Finds the first `SALT`, `ITER`, `WPKY` triple within the search window.
    ///
    /// Buffers shorter than [`MIN_MANIFEST_LEN`] yield `Ok(None)`, as does a
    /// buffer where no such triple exists. A record whose declared length
    /// runs past the end of the buffer is an error.
    #[tracing::instrument(skip(self), fields(len = self.data.len()))]
    pub fn scan_primary(&self) -> Result<Option<PrimaryTier>> {
        if self.data.len() < MIN_MANIFEST_LEN {
            return Ok(None);
        }
        let Some([salt_at, iter_at, wpky_at]) =
            find_tag_group(self.data, [SALT, ITER, WPKY], MAX_PLIST_SEARCH_DISTANCE)
        else {
            return Ok(None);
        };

        let salt = read_record(self.data, SALT, salt_at)?.to_vec();
        let iteration_count = decode_be_uint(ITER, read_record(self.data, ITER, iter_at)?)?;
        let wpky = read_record(self.data, WPKY, wpky_at)?.to_vec();

        debug!(
            "Primary tier: SALT@{:#x} ITER@{:#x} WPKY@{:#x}, {} iterations",
            salt_at, iter_at, wpky_at, iteration_count
        );

        Ok(Some(PrimaryTier {
            wpky,
            salt,
            iteration_count,
        }))
    }

    /// Finds the first `DPIC`, `DPSL` pair within the search window.
    #[tracing::instrument(skip(self), fields(len = self.data.len()))]
    pub fn scan_secondary(&self) -> Result<Option<SecondaryTier>> {
        if self.data.len() < MIN_MANIFEST_LEN {
            return Ok(None);
        }
        let Some([dpic_at, dpsl_at]) =
            find_tag_group(self.data, [DPIC, DPSL], MAX_PLIST_SEARCH_DISTANCE)
        else {
            return Ok(None);
        };

        let dpic = decode_be_uint(DPIC, read_record(self.data, DPIC, dpic_at)?)?;
        let dpsl = read_record(self.data, DPSL, dpsl_at)?.to_vec();

        debug!(
            "Secondary tier: DPIC@{:#x} DPSL@{:#x}, {} iterations",
            dpic_at, dpsl_at, dpic
        );

        Ok(Some(SecondaryTier { dpic, dpsl }))
    }

    /// Runs both scans.
    pub fn extract(&self) -> Result<ExtractionResult> {
        let mut result = self
            .scan_primary()?
            .map(ExtractionResult::from)
            .unwrap_or_default();
        result.secondary = self.scan_secondary()?;
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashVersion {
    /// Backups up to iOS 10.1
    V9,
    /// Backups with the DPIC/DPSL tier
    V10,
}

impl fmt::Display for HashVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashVersion::V9 => write!(f, "9"),
            HashVersion::V10 => write!(f, "10"),
        }
    }
}

/// A validated hash, rendered by its `Display` impl as
/// `$itunes_backup$*<version>*<wpky>*<iter>*<salt>*<dpic>*<dpsl>`
/// with the last two fields empty for version 9.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestHash {
    primary: PrimaryTier,
    secondary: Option<SecondaryTier>,
}

impl ManifestHash {
    /// Validates the extracted fields.
    ///
    /// A zero iteration count counts as missing. A secondary tier with an
    /// empty `DPSL` payload is ignored and produces a version 9 hash.
    pub fn format(result: &ExtractionResult) -> Result<Self> {
        let (wpky, salt, iteration_count) =
            match (&result.wpky, &result.salt, result.iteration_count) {
                (Some(wpky), Some(salt), Some(iter))
                    if !wpky.is_empty() && !salt.is_empty() && iter != 0 =>
                {
                    (wpky, salt, iter)
                }
                _ => return Err(Error::MissingFields),
            };

        if wpky.len() != WPKY_LEN {
            return Err(Error::InvalidLength {
                field: "WPKY",
                expected: WPKY_LEN,
                found: wpky.len(),
            });
        }
        if salt.len() != SALT_LEN {
            return Err(Error::InvalidLength {
                field: "SALT",
                expected: SALT_LEN,
                found: salt.len(),
            });
        }

        let secondary = match &result.secondary {
            Some(tier) if !tier.dpsl.is_empty() => {
                if tier.dpic < 1 || tier.dpsl.len() != DPSL_LEN {
                    return Err(Error::InvalidSecondary);
                }
                Some(tier.clone())
            }
            Some(_) => {
                trace!("Ignoring secondary tier with empty DPSL");
                None
            }
            None => None,
        };

        Ok(Self {
            primary: PrimaryTier {
                wpky: wpky.clone(),
                salt: salt.clone(),
                iteration_count,
            },
            secondary,
        })
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_MANIFEST_LEN {
            return Err(Error::BufferTooShort(data.len()));
        }
        let result = ManifestReader::new(data).extract()?;
        if result.wpky.is_none() {
            return Err(Error::RecordNotFound {
                group: "SALT/ITER/WPKY",
            });
        }
        Self::format(&result)
    }

    pub fn read_from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    pub fn version(&self) -> HashVersion {
        match self.secondary {
            Some(_) => HashVersion::V10,
            None => HashVersion::V9,
        }
    }

    pub fn primary(&self) -> &PrimaryTier {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&SecondaryTier> {
        self.secondary.as_ref()
    }
}

impl fmt::Display for ManifestHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}*{}*{}*{}*{}*",
            HASH_PREFIX,
            self.version(),
            hex::encode(&self.primary.wpky),
            self.primary.iteration_count,
            hex::encode(&self.primary.salt)
        )?;
        if let Some(tier) = &self.secondary {
            write!(f, "{}*{}", tier.dpic, hex::encode(&tier.dpsl))?;
        } else {
            write!(f, "*")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn record(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = tag.to_vec();
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn keybag(iterations: u32) -> Vec<u8> {
        let mut data = record(b"VERS", &3u32.to_be_bytes());
        data.extend(record(SALT, &[0x22; 20]));
        data.extend(record(ITER, &iterations.to_be_bytes()));
        data.extend(record(b"CLAS", &1u32.to_be_bytes()));
        data.extend(record(WPKY, &[0x11; 40]));
        data
    }

    fn primary_result() -> ExtractionResult {
        ExtractionResult {
            wpky: Some(vec![0x11; 40]),
            salt: Some(vec![0x22; 20]),
            iteration_count: Some(10000),
            secondary: None,
        }
    }

    #[test]
    fn test_scan_short_buffer() {
        let reader = ManifestReader::new(b"SALTITERWPKY");
        assert_eq!(reader.scan_primary().unwrap(), None);
        assert_eq!(reader.scan_secondary().unwrap(), None);
        assert_eq!(reader.extract().unwrap(), ExtractionResult::default());
    }

    #[test]
    fn test_scan_below_minimum_length() {
        let mut bag = keybag(10000);
        bag.extend(record(DPIC, &1u32.to_be_bytes()));
        bag.extend(record(DPSL, &[0x33; 20]));

        for len in 0..MIN_MANIFEST_LEN {
            for data in [vec![b'A'; len], bag[..len].to_vec()] {
                let reader = ManifestReader::new(&data);
                assert_eq!(reader.scan_primary().unwrap(), None);
                assert_eq!(reader.scan_secondary().unwrap(), None);
                assert!(matches!(
                    ManifestHash::from_bytes(&data),
                    Err(Error::BufferTooShort(n)) if n == len
                ));
            }
        }
    }

    #[test]
    fn test_scan_at_minimum_length() {
        let mut data = record(DPIC, &[0x07]);
        data.extend(record(DPSL, &[0x33; 7]));
        assert_eq!(data.len(), MIN_MANIFEST_LEN);

        let reader = ManifestReader::new(&data);
        assert_eq!(
            reader.scan_secondary().unwrap(),
            Some(SecondaryTier {
                dpic: 7,
                dpsl: vec![0x33; 7],
            })
        );
        assert_eq!(reader.scan_primary().unwrap(), None);
        assert!(matches!(
            ManifestHash::from_bytes(&data),
            Err(Error::RecordNotFound { .. })
        ));
        assert!(matches!(
            ManifestHash::from_bytes(&[b'A'; MIN_MANIFEST_LEN]),
            Err(Error::RecordNotFound { .. })
        ));
        assert_eq!(
            reader.scan_secondary().unwrap(),
            reader.extract().unwrap().secondary
        );

        let short = ManifestReader::new(&data[..MIN_MANIFEST_LEN - 1]);
        assert_eq!(short.scan_secondary().unwrap(), None);
    }

    #[traced_test]
    #[test]
    fn test_scan_primary() {
        let data = keybag(10000);
        let primary = ManifestReader::new(&data).scan_primary().unwrap().unwrap();
        assert_eq!(primary.wpky, vec![0x11; 40]);
        assert_eq!(primary.salt, vec![0x22; 20]);
        assert_eq!(primary.iteration_count, 10000);
    }

    #[traced_test]
    #[test]
    fn test_scan_primary_prefers_close_triple() {
        let mut data = record(SALT, &[0x99; 20]);
        data.extend(record(ITER, &1u32.to_be_bytes()));
        data.extend(vec![0u8; 300]);
        data.extend(record(WPKY, &[0x99; 40]));
        data.extend(keybag(5000));

        let primary = ManifestReader::new(&data).scan_primary().unwrap().unwrap();
        assert_eq!(primary.salt, vec![0x22; 20]);
        assert_eq!(primary.wpky, vec![0x11; 40]);
        assert_eq!(primary.iteration_count, 5000);
    }

    #[test]
    fn test_scan_primary_truncated() {
        let mut data = record(SALT, &[0x22; 20]);
        data.extend(record(ITER, &10000u32.to_be_bytes()));
        data.extend(WPKY);
        data.extend(&40u32.to_be_bytes());
        data.extend(&[0x11; 12]);
        assert!(matches!(
            ManifestReader::new(&data).scan_primary(),
            Err(Error::Truncated { tag: "WPKY", declared: 40, available: 12 })
        ));
    }

    #[test]
    fn test_scan_secondary() {
        let mut data = keybag(10000);
        data.extend(record(b"DPWT", &1u32.to_be_bytes()));
        data.extend(record(DPIC, &10_000_000u32.to_be_bytes()));
        data.extend(record(DPSL, &[0x33; 20]));

        let reader = ManifestReader::new(&data);
        let tier = reader.scan_secondary().unwrap().unwrap();
        assert_eq!(tier.dpic, 10_000_000);
        assert_eq!(tier.dpsl, vec![0x33; 20]);

        let result = reader.extract().unwrap();
        assert_eq!(result.iteration_count, Some(10000));
        assert_eq!(result.secondary, Some(tier));
    }

    #[test]
    fn test_format_v9() {
        let hash = ManifestHash::format(&primary_result()).unwrap();
        assert_eq!(hash.version(), HashVersion::V9);
        assert_eq!(hash.primary().wpky, vec![0x11; 40]);
        assert_eq!(hash.secondary(), None);
        assert_eq!(
            hash.to_string(),
            format!(
                "$itunes_backup$*9*{}*10000*{}**",
                "11".repeat(40),
                "22".repeat(20)
            )
        );
    }

    #[test]
    fn test_format_v10() {
        let mut result = primary_result();
        result.secondary = Some(SecondaryTier {
            dpic: 10_000_000,
            dpsl: vec![0xab; 20],
        });
        let hash = ManifestHash::format(&result).unwrap();
        assert_eq!(hash.version(), HashVersion::V10);
        assert_eq!(hash.primary().iteration_count, 10000);
        assert_eq!(hash.secondary().map(|tier| tier.dpic), Some(10_000_000));
        assert_eq!(
            hash.to_string(),
            format!(
                "$itunes_backup$*10*{}*10000*{}*10000000*{}",
                "11".repeat(40),
                "22".repeat(20),
                "ab".repeat(20)
            )
        );
    }

    #[test]
    fn test_format_is_idempotent() {
        let result = primary_result();
        let first = ManifestHash::format(&result).unwrap().to_string();
        let second = ManifestHash::format(&result).unwrap().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn test_format_missing_fields() {
        for result in [
            ExtractionResult::default(),
            ExtractionResult {
                wpky: None,
                ..primary_result()
            },
            ExtractionResult {
                salt: None,
                ..primary_result()
            },
            ExtractionResult {
                iteration_count: None,
                ..primary_result()
            },
            ExtractionResult {
                iteration_count: Some(0),
                ..primary_result()
            },
        ] {
            assert!(matches!(
                ManifestHash::format(&result),
                Err(Error::MissingFields)
            ));
        }
    }

    #[test]
    fn test_format_invalid_length() {
        let mut result = primary_result();
        result.wpky = Some(vec![0x11; 39]);
        result.secondary = Some(SecondaryTier {
            dpic: 0,
            dpsl: vec![],
        });
        assert!(matches!(
            ManifestHash::format(&result),
            Err(Error::InvalidLength { field: "WPKY", expected: 40, found: 39 })
        ));

        let mut result = primary_result();
        result.salt = Some(vec![0x22; 16]);
        assert!(matches!(
            ManifestHash::format(&result),
            Err(Error::InvalidLength { field: "SALT", .. })
        ));
    }

    #[test]
    fn test_format_invalid_secondary() {
        let mut result = primary_result();
        result.secondary = Some(SecondaryTier {
            dpic: 0,
            dpsl: vec![0x33; 20],
        });
        assert!(matches!(
            ManifestHash::format(&result),
            Err(Error::InvalidSecondary)
        ));

        result.secondary = Some(SecondaryTier {
            dpic: 1,
            dpsl: vec![0x33; 19],
        });
        assert!(matches!(
            ManifestHash::format(&result),
            Err(Error::InvalidSecondary)
        ));
    }

    #[test]
    fn test_format_empty_dpsl_is_v9() {
        let mut result = primary_result();
        result.secondary = Some(SecondaryTier {
            dpic: 0,
            dpsl: vec![],
        });
        let hash = ManifestHash::format(&result).unwrap();
        assert_eq!(hash.version(), HashVersion::V9);
        assert!(hash.to_string().ends_with("**"));
    }

    #[test]
    fn test_from_bytes_errors() {
        assert!(matches!(
            ManifestHash::from_bytes(&[0u8; 10]),
            Err(Error::BufferTooShort(10))
        ));
        assert!(matches!(
            ManifestHash::from_bytes(&[0u8; 64]),
            Err(Error::RecordNotFound { .. })
        ));
    }

    #[test]
    fn test_debug_is_hex() {
        let debug = format!("{:?}", primary_result());
        assert!(debug.contains(&"11".repeat(40)));
    }
}
