//! Backup key grammar.
//!
//! Two encodings share one value type:
//!
//! - manifest: `<rsc>_back_<YYYYMMDD_HHMMSS>[:<suffix>][^<snap>].meta`
//! - volume data: `<rsc>_vol<nr>_<YYYYMMDD_HHMMSS>[:<suffix>][^<snap>]`
//!
//! The snapshot name defaults to `back_<timestamp>` and is only written out when it differs.
//! Anything that does not match is "not a key" (`None`), never an error.

use chrono::NaiveDateTime;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
pub const META_SUFFIX: &str = ".meta";
pub const SNAP_PREFIX: &str = "back_";

fn manifest_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?P<rsc>[a-zA-Z0-9_-]{2,48})_back_(?P<ts>[0-9]{8}_[0-9]{6})(?::(?P<suffix>[a-zA-Z0-9_-]+))?(?:\^(?P<snap>[a-zA-Z0-9_-]{2,48}))?\.meta$",
        )
        .expect("static manifest key pattern")
    })
}

fn data_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?P<rsc>[a-zA-Z0-9_-]{2,48})_vol(?P<vlm>[0-9]{1,5})_(?P<ts>[0-9]{8}_[0-9]{6})(?::(?P<suffix>[a-zA-Z0-9_-]+))?(?:\^(?P<snap>[a-zA-Z0-9_-]{2,48}))?$",
        )
        .expect("static data key pattern")
    })
}

/// Identity of one remote backup object. `volume` is `None` for manifest keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackupKey {
    pub rsc_name: String,
    pub volume: Option<u32>,
    pub timestamp: NaiveDateTime,
    pub suffix: Option<String>,
    pub snap_name: String,
}

impl BackupKey {
    /// Manifest key for a new backup; the snapshot name defaults to `back_<timestamp>`.
    pub fn manifest(
        rsc_name: impl Into<String>,
        timestamp: NaiveDateTime,
        suffix: Option<String>,
        snap_name: Option<String>,
    ) -> Self {
        let snap_name = snap_name.unwrap_or_else(|| default_snap_name(&timestamp));
        BackupKey {
            rsc_name: rsc_name.into(),
            volume: None,
            timestamp,
            suffix,
            snap_name,
        }
    }

    /// The data key of volume `volume` belonging to this backup.
    pub fn data(&self, volume: u32) -> Self {
        BackupKey {
            volume: Some(volume),
            ..self.clone()
        }
    }

    /// The manifest key this key belongs to.
    pub fn to_manifest(&self) -> Self {
        BackupKey {
            volume: None,
            ..self.clone()
        }
    }

    pub fn is_manifest(&self) -> bool {
        self.volume.is_none()
    }

    pub fn timestamp_str(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Logical id of the backup: the manifest key without `.meta`.
    pub fn backup_id(&self) -> String {
        let manifest = self.to_manifest().to_string();
        manifest.trim_end_matches(META_SUFFIX).to_string()
    }

    /// Whether two keys belong to the same logical backup.
    pub fn same_backup(&self, other: &BackupKey) -> bool {
        self.rsc_name == other.rsc_name
            && self.timestamp == other.timestamp
            && self.suffix == other.suffix
            && self.snap_name == other.snap_name
    }

    fn tail(&self) -> String {
        let mut tail = String::new();
        if let Some(suffix) = &self.suffix {
            tail.push(':');
            tail.push_str(suffix);
        }
        if self.snap_name != default_snap_name(&self.timestamp) {
            tail.push('^');
            tail.push_str(&self.snap_name);
        }
        tail
    }
}

impl fmt::Display for BackupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.volume {
            None => write!(
                f,
                "{}_{}{}{}{}",
                self.rsc_name,
                SNAP_PREFIX,
                self.timestamp_str(),
                self.tail(),
                META_SUFFIX
            ),
            Some(vlm) => write!(
                f,
                "{}_vol{}_{}{}",
                self.rsc_name,
                vlm,
                self.timestamp_str(),
                self.tail()
            ),
        }
    }
}

pub fn default_snap_name(timestamp: &NaiveDateTime) -> String {
    format!("{}{}", SNAP_PREFIX, timestamp.format(TIMESTAMP_FORMAT))
}

pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).ok()
}

/// Parses a manifest key. Returns `None` for anything else.
pub fn parse_manifest_key(key: &str) -> Option<BackupKey> {
    let caps = manifest_pattern().captures(key)?;
    let timestamp = parse_timestamp(&caps["ts"])?;
    Some(BackupKey::manifest(
        &caps["rsc"],
        timestamp,
        caps.name("suffix").map(|m| m.as_str().to_string()),
        caps.name("snap").map(|m| m.as_str().to_string()),
    ))
}

/// Parses a volume data key. Returns `None` for anything else.
pub fn parse_data_key(key: &str) -> Option<BackupKey> {
    let caps = data_pattern().captures(key)?;
    let volume: u32 = caps["vlm"].parse().ok()?;
    let timestamp = parse_timestamp(&caps["ts"])?;
    let base = BackupKey::manifest(
        &caps["rsc"],
        timestamp,
        caps.name("suffix").map(|m| m.as_str().to_string()),
        caps.name("snap").map(|m| m.as_str().to_string()),
    );
    Some(base.data(volume))
}

/// Parses either encoding.
pub fn parse_key(key: &str) -> Option<BackupKey> {
    parse_manifest_key(key).or_else(|| parse_data_key(key))
}

/// Appends `.meta` to a backup id unless it already carries it.
pub fn manifest_key_for_id(id: &str) -> String {
    if id.ends_with(META_SUFFIX) {
        id.to_string()
    } else {
        format!("{id}{META_SUFFIX}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn ts(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_parse_plain_manifest_key() {
        let key = parse_manifest_key("rsc_back_20240101_000000.meta").unwrap();
        assert_eq!(key.rsc_name, "rsc");
        assert_eq!(key.volume, None);
        assert_eq!(key.timestamp, ts(2024, 1, 1, 0, 0, 0));
        assert_eq!(key.suffix, None);
        assert_eq!(key.snap_name, "back_20240101_000000");
        assert_eq!(key.backup_id(), "rsc_back_20240101_000000");
    }

    #[test]
    fn test_parse_manifest_key_with_suffix_and_snap() {
        let key = parse_manifest_key("my-rsc_back_20240203_101112:site1^nightly.meta").unwrap();
        assert_eq!(key.rsc_name, "my-rsc");
        assert_eq!(key.suffix.as_deref(), Some("site1"));
        assert_eq!(key.snap_name, "nightly");
        assert_eq!(key.to_string(), "my-rsc_back_20240203_101112:site1^nightly.meta");
    }

    #[test]
    fn test_parse_data_key() {
        let key = parse_data_key("rsc_vol0_20240101_000000").unwrap();
        assert_eq!(key.volume, Some(0));
        assert_eq!(key.snap_name, "back_20240101_000000");
        assert_eq!(key.to_manifest().to_string(), "rsc_back_20240101_000000.meta");
        assert!(parse_manifest_key("rsc_vol0_20240101_000000").is_none());
    }

    #[test]
    fn test_not_a_key() {
        assert!(parse_key("random-object.txt").is_none());
        assert!(parse_key("rsc_back_20241301_000000.meta").is_none());
        assert!(parse_key("rsc_back_20240101_000000").is_none());
        assert!(parse_key("r_back_20240101_000000.meta").is_none());
        assert!(parse_key("rsc_vol0_20240101_000000.meta").is_none());
    }

    #[test]
    fn test_manifest_key_for_id() {
        assert_eq!(manifest_key_for_id("rsc_back_20240101_000000"), "rsc_back_20240101_000000.meta");
        assert_eq!(manifest_key_for_id("rsc_back_20240101_000000.meta"), "rsc_back_20240101_000000.meta");
    }

    #[test]
    fn test_same_backup() {
        let manifest = parse_manifest_key("rsc_back_20240101_000000.meta").unwrap();
        let data = parse_data_key("rsc_vol3_20240101_000000").unwrap();
        let other = parse_data_key("rsc_vol3_20240101_000000:other").unwrap();
        assert!(manifest.same_backup(&data));
        assert!(!manifest.same_backup(&other));
    }

    fn arb_key() -> impl Strategy<Value = BackupKey> {
        (
            "[a-zA-Z0-9-]{2,20}",
            proptest::option::of(0u32..99999),
            0i64..4_000_000_000,
            proptest::option::of("[a-zA-Z0-9_-]{1,12}"),
            proptest::option::of("[a-zA-Z0-9_-]{2,48}"),
        )
            .prop_map(|(rsc, volume, secs, suffix, snap)| {
                let timestamp = chrono::DateTime::from_timestamp(secs, 0).unwrap().naive_utc();
                let key = BackupKey::manifest(rsc, timestamp, suffix, snap);
                match volume {
                    Some(vlm) => key.data(vlm),
                    None => key,
                }
            })
    }

    proptest! {
        #[test]
        fn test_format_parse_round_trip(key in arb_key()) {
            let text = key.to_string();
            let parsed = if key.is_manifest() {
                parse_manifest_key(&text)
            } else {
                parse_data_key(&text)
            };
            prop_assert_eq!(parsed, Some(key));
        }
    }
}
