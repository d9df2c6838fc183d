//! Shard keys and their canonical byte encoding
//!
//! A [`ShardKey`] is either a typed value or the `Max` sentinel of its type.
//! Every value has a canonical raw encoding whose unsigned lexicographic
//! order matches the backing store's collation for that type:
//!
//! - Int32/Int64: big-endian with the sign bit flipped
//! - Guid: the store's mixed-endian uniqueidentifier byte order
//! - Binary: the bytes themselves
//! - DateTime/TimeSpan: 100ns ticks encoded as Int64
//! - DateTimeOffset: UTC ticks followed by offset ticks, both as Int64
//!
//! Trailing zero bytes are truncated from the canonical form, so raw values
//! read back from fixed-width columns compare equal to the originals.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Maximum size of a binary key in bytes
pub const MAX_BINARY_KEY_SIZE: usize = 128;

const TICKS_PER_SECOND: i64 = 10_000_000;
const NANOS_PER_TICK: i64 = 100;
/// Ticks between 0001-01-01 and the Unix epoch
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;
/// Ticks of 9999-12-31 23:59:59.9999999
const MAX_DATE_TIME_TICKS: i64 = 3_155_378_975_999_999_999;
/// Offsets are limited to +/- 14 hours
const MAX_OFFSET_TICKS: i64 = 14 * 60 * 60 * TICKS_PER_SECOND;

/// Byte significance used by the store when comparing uniqueidentifiers,
/// expressed as indices into the mixed-endian GUID byte layout.
const GUID_ORDER: [usize; 16] = [10, 11, 12, 13, 14, 15, 8, 9, 6, 7, 4, 5, 0, 1, 2, 3];

/// Supported shard key kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShardKeyType {
    Int32,
    Int64,
    Guid,
    Binary,
    DateTime,
    DateTimeOffset,
    TimeSpan,
}

impl ShardKeyType {
    /// Width of the raw encoding (upper bound for binary keys)
    #[must_use]
    pub const fn raw_width(self) -> usize {
        match self {
            Self::Int32 => 4,
            Self::Int64 | Self::DateTime | Self::TimeSpan => 8,
            Self::Guid | Self::DateTimeOffset => 16,
            Self::Binary => MAX_BINARY_KEY_SIZE,
        }
    }

    /// Whether raw values of this type always have the same width
    #[must_use]
    pub const fn is_fixed_width(self) -> bool {
        !matches!(self, Self::Binary)
    }
}

impl fmt::Display for ShardKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Typed value of a shard key
#[derive(Clone, Debug, PartialEq)]
pub enum ShardKeyValue {
    Int32(i32),
    Int64(i64),
    Guid(Uuid),
    Binary(Vec<u8>),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
    TimeSpan(Duration),
}

impl ShardKeyValue {
    /// Key type of this value
    #[must_use]
    pub const fn key_type(&self) -> ShardKeyType {
        match self {
            Self::Int32(_) => ShardKeyType::Int32,
            Self::Int64(_) => ShardKeyType::Int64,
            Self::Guid(_) => ShardKeyType::Guid,
            Self::Binary(_) => ShardKeyType::Binary,
            Self::DateTime(_) => ShardKeyType::DateTime,
            Self::DateTimeOffset(_) => ShardKeyType::DateTimeOffset,
            Self::TimeSpan(_) => ShardKeyType::TimeSpan,
        }
    }
}

impl fmt::Display for ShardKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Guid(v) => write!(f, "{v}"),
            Self::Binary(v) => write!(f, "0x{}", hex::encode(v)),
            Self::DateTime(v) => write!(f, "{v}"),
            Self::DateTimeOffset(v) => write!(f, "{}", v.to_rfc3339()),
            Self::TimeSpan(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Clone, Debug)]
enum KeyPoint {
    Value { value: ShardKeyValue, raw: Vec<u8> },
    Max,
}

/// Shard key: a typed value with canonical encoding, or the `Max` sentinel
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(into = "RawShardKey", try_from = "RawShardKey")]
pub struct ShardKey {
    key_type: ShardKeyType,
    point: KeyPoint,
}

impl ShardKey {
    /// Create a key from a typed value, inferring the key type
    pub fn new(value: ShardKeyValue) -> Result<Self> {
        let key_type = value.key_type();
        let raw = encode(&value)?;
        // Re-derive the value so time types are held at tick precision
        let value = match value {
            ShardKeyValue::Binary(_) => value,
            _ => decode(key_type, &pad(&raw, key_type.raw_width()))?,
        };
        Ok(Self {
            key_type,
            point: KeyPoint::Value { value, raw },
        })
    }

    /// Create a key from a dynamically typed value
    ///
    /// Supports `i32`, `i64`, `Uuid`, `Vec<u8>`, `NaiveDateTime`,
    /// `DateTime<FixedOffset>` and `chrono::Duration`.
    pub fn from_dyn(value: &dyn Any) -> Result<Self> {
        if let Some(v) = value.downcast_ref::<i32>() {
            Ok(Self::from(*v))
        } else if let Some(v) = value.downcast_ref::<i64>() {
            Ok(Self::from(*v))
        } else if let Some(v) = value.downcast_ref::<Uuid>() {
            Ok(Self::from(*v))
        } else if let Some(v) = value.downcast_ref::<Vec<u8>>() {
            Self::new(ShardKeyValue::Binary(v.clone()))
        } else if let Some(v) = value.downcast_ref::<NaiveDateTime>() {
            Self::new(ShardKeyValue::DateTime(*v))
        } else if let Some(v) = value.downcast_ref::<DateTime<FixedOffset>>() {
            Self::new(ShardKeyValue::DateTimeOffset(*v))
        } else if let Some(v) = value.downcast_ref::<Duration>() {
            Self::new(ShardKeyValue::TimeSpan(*v))
        } else {
            Err(Error::invalid_argument(
                "unsupported shard key value type; expected i32, i64, Uuid, Vec<u8>, \
                 NaiveDateTime, DateTime<FixedOffset> or Duration",
            ))
        }
    }

    /// Decode a key from its raw encoding
    ///
    /// Fixed-width types accept truncated values (implicitly zero-padded)
    /// and values with extra trailing zero bytes.
    pub fn from_raw(key_type: ShardKeyType, raw: &[u8]) -> Result<Self> {
        let width = key_type.raw_width();
        if key_type.is_fixed_width() {
            let canonical = truncate_trailing_zeros(raw);
            if canonical.len() > width {
                return Err(Error::invalid_argument(format!(
                    "raw value of {} bytes is too long for a {key_type} key ({width} bytes)",
                    raw.len()
                )));
            }
            let value = decode(key_type, &pad(canonical, width))?;
            Ok(Self {
                key_type,
                point: KeyPoint::Value {
                    value,
                    raw: canonical.to_vec(),
                },
            })
        } else {
            if raw.len() > width {
                return Err(Error::invalid_argument(format!(
                    "binary key of {} bytes exceeds the maximum of {width} bytes",
                    raw.len()
                )));
            }
            Ok(Self {
                key_type,
                point: KeyPoint::Value {
                    value: ShardKeyValue::Binary(raw.to_vec()),
                    raw: truncate_trailing_zeros(raw).to_vec(),
                },
            })
        }
    }

    /// The `Max` sentinel of the given type
    #[must_use]
    pub const fn max(key_type: ShardKeyType) -> Self {
        Self {
            key_type,
            point: KeyPoint::Max,
        }
    }

    /// Smallest key of the given type
    #[must_use]
    pub fn min(key_type: ShardKeyType) -> Self {
        let (value, raw) = match key_type {
            ShardKeyType::Int32 => (ShardKeyValue::Int32(i32::MIN), Vec::new()),
            ShardKeyType::Int64 => (ShardKeyValue::Int64(i64::MIN), Vec::new()),
            ShardKeyType::Guid => (ShardKeyValue::Guid(Uuid::nil()), Vec::new()),
            ShardKeyType::Binary => (ShardKeyValue::Binary(Vec::new()), Vec::new()),
            ShardKeyType::TimeSpan => (
                ShardKeyValue::TimeSpan(ticks_to_duration(i64::MIN)),
                Vec::new(),
            ),
            ShardKeyType::DateTime => {
                let raw = encode_i64(0).to_vec();
                return Self::from_raw(key_type, &raw).unwrap_or(Self::max(key_type));
            }
            ShardKeyType::DateTimeOffset => {
                let mut raw = encode_i64(0).to_vec();
                raw.extend_from_slice(&encode_i64(-MAX_OFFSET_TICKS));
                return Self::from_raw(key_type, &raw).unwrap_or(Self::max(key_type));
            }
        };
        Self {
            key_type,
            point: KeyPoint::Value { value, raw },
        }
    }

    /// Key type
    #[must_use]
    pub const fn key_type(&self) -> ShardKeyType {
        self.key_type
    }

    /// Whether this is the `Max` sentinel
    #[must_use]
    pub const fn is_max(&self) -> bool {
        matches!(self.point, KeyPoint::Max)
    }

    /// Typed value, `None` for `Max`
    #[must_use]
    pub const fn value(&self) -> Option<&ShardKeyValue> {
        match &self.point {
            KeyPoint::Value { value, .. } => Some(value),
            KeyPoint::Max => None,
        }
    }

    /// Canonical raw encoding, `None` for `Max`
    #[must_use]
    pub fn raw_value(&self) -> Option<&[u8]> {
        match &self.point {
            KeyPoint::Value { raw, .. } => Some(raw),
            KeyPoint::Max => None,
        }
    }

    /// Immediate successor in key order, or `Max` at the top of the domain
    pub fn next(&self) -> Result<Self> {
        let KeyPoint::Value { value, raw } = &self.point else {
            return Err(Error::illegal_state(format!(
                "the {} Max key has no successor",
                self.key_type
            )));
        };

        match value {
            ShardKeyValue::DateTime(_) => {
                let ticks = decode_i64(&pad(raw, 8));
                if ticks >= MAX_DATE_TIME_TICKS {
                    return Ok(Self::max(self.key_type));
                }
                Self::from_raw(self.key_type, &encode_i64(ticks + 1))
            }
            ShardKeyValue::DateTimeOffset(_) => {
                let padded = pad(raw, 16);
                let ticks = decode_i64(&padded[..8]);
                if ticks >= MAX_DATE_TIME_TICKS {
                    return Ok(Self::max(self.key_type));
                }
                let mut next = encode_i64(ticks + 1).to_vec();
                next.extend_from_slice(&padded[8..]);
                Self::from_raw(self.key_type, &next)
            }
            _ => match increment(&pad(raw, self.key_type.raw_width())) {
                Some(next) => Self::from_raw(self.key_type, &next),
                None => Ok(Self::max(self.key_type)),
            },
        }
    }

    /// Bytes persisted for this key: canonical raw form, except that binary
    /// keys keep their exact value bytes
    fn persisted_bytes(&self) -> Option<Vec<u8>> {
        match &self.point {
            KeyPoint::Value {
                value: ShardKeyValue::Binary(bytes),
                ..
            } => Some(bytes.clone()),
            KeyPoint::Value { raw, .. } => Some(raw.clone()),
            KeyPoint::Max => None,
        }
    }
}

impl PartialEq for ShardKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ShardKey {}

impl Hash for ShardKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key_type.hash(state);
        self.raw_value().hash(state);
    }
}

impl Ord for ShardKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_type
            .cmp(&other.key_type)
            .then_with(|| match (&self.point, &other.point) {
                (KeyPoint::Max, KeyPoint::Max) => Ordering::Equal,
                (KeyPoint::Max, KeyPoint::Value { .. }) => Ordering::Greater,
                (KeyPoint::Value { .. }, KeyPoint::Max) => Ordering::Less,
                (KeyPoint::Value { raw: a, .. }, KeyPoint::Value { raw: b, .. }) => a.cmp(b),
            })
    }
}

impl PartialOrd for ShardKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.point {
            KeyPoint::Value { value, .. } => write!(f, "{value}"),
            KeyPoint::Max => write!(f, "+inf({})", self.key_type),
        }
    }
}

impl From<i32> for ShardKey {
    fn from(value: i32) -> Self {
        let raw = truncate_trailing_zeros(&encode_i32(value)).to_vec();
        Self {
            key_type: ShardKeyType::Int32,
            point: KeyPoint::Value {
                value: ShardKeyValue::Int32(value),
                raw,
            },
        }
    }
}

impl From<i64> for ShardKey {
    fn from(value: i64) -> Self {
        let raw = truncate_trailing_zeros(&encode_i64(value)).to_vec();
        Self {
            key_type: ShardKeyType::Int64,
            point: KeyPoint::Value {
                value: ShardKeyValue::Int64(value),
                raw,
            },
        }
    }
}

impl From<Uuid> for ShardKey {
    fn from(value: Uuid) -> Self {
        let raw = truncate_trailing_zeros(&encode_guid(&value)).to_vec();
        Self {
            key_type: ShardKeyType::Guid,
            point: KeyPoint::Value {
                value: ShardKeyValue::Guid(value),
                raw,
            },
        }
    }
}

impl TryFrom<Vec<u8>> for ShardKey {
    type Error = Error;

    fn try_from(value: Vec<u8>) -> Result<Self> {
        Self::new(ShardKeyValue::Binary(value))
    }
}

impl TryFrom<&[u8]> for ShardKey {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        Self::new(ShardKeyValue::Binary(value.to_vec()))
    }
}

impl TryFrom<NaiveDateTime> for ShardKey {
    type Error = Error;

    fn try_from(value: NaiveDateTime) -> Result<Self> {
        Self::new(ShardKeyValue::DateTime(value))
    }
}

impl TryFrom<DateTime<FixedOffset>> for ShardKey {
    type Error = Error;

    fn try_from(value: DateTime<FixedOffset>) -> Result<Self> {
        Self::new(ShardKeyValue::DateTimeOffset(value))
    }
}

impl TryFrom<Duration> for ShardKey {
    type Error = Error;

    fn try_from(value: Duration) -> Result<Self> {
        Self::new(ShardKeyValue::TimeSpan(value))
    }
}

/// Serialized form of a shard key
#[derive(Clone, Debug, Serialize, Deserialize)]
struct RawShardKey {
    key_type: ShardKeyType,
    raw: Option<Vec<u8>>,
}

impl From<ShardKey> for RawShardKey {
    fn from(key: ShardKey) -> Self {
        Self {
            key_type: key.key_type,
            raw: key.persisted_bytes(),
        }
    }
}

impl TryFrom<RawShardKey> for ShardKey {
    type Error = Error;

    fn try_from(raw: RawShardKey) -> Result<Self> {
        match raw.raw {
            Some(bytes) => Self::from_raw(raw.key_type, &bytes),
            None => Ok(Self::max(raw.key_type)),
        }
    }
}

// ---- Encoding ----

fn encode(value: &ShardKeyValue) -> Result<Vec<u8>> {
    let raw = match value {
        ShardKeyValue::Int32(v) => encode_i32(*v).to_vec(),
        ShardKeyValue::Int64(v) => encode_i64(*v).to_vec(),
        ShardKeyValue::Guid(v) => encode_guid(v).to_vec(),
        ShardKeyValue::Binary(v) => {
            if v.len() > MAX_BINARY_KEY_SIZE {
                return Err(Error::invalid_argument(format!(
                    "binary key of {} bytes exceeds the maximum of {MAX_BINARY_KEY_SIZE} bytes",
                    v.len()
                )));
            }
            v.clone()
        }
        ShardKeyValue::DateTime(v) => encode_i64(datetime_to_ticks(v)?).to_vec(),
        ShardKeyValue::DateTimeOffset(v) => {
            let utc_ticks = datetime_to_ticks(&v.naive_utc())?;
            let offset_ticks = i64::from(v.offset().local_minus_utc()) * TICKS_PER_SECOND;
            if offset_ticks.abs() > MAX_OFFSET_TICKS {
                return Err(Error::invalid_argument(format!(
                    "offset of {v} is outside +/-14 hours"
                )));
            }
            let mut raw = encode_i64(utc_ticks).to_vec();
            raw.extend_from_slice(&encode_i64(offset_ticks));
            raw
        }
        ShardKeyValue::TimeSpan(v) => encode_i64(duration_to_ticks(v)?).to_vec(),
    };
    Ok(truncate_trailing_zeros(&raw).to_vec())
}

/// Decode a raw value already padded to the type's width
fn decode(key_type: ShardKeyType, raw: &[u8]) -> Result<ShardKeyValue> {
    match key_type {
        ShardKeyType::Int32 => {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&raw[..4]);
            Ok(ShardKeyValue::Int32((u32::from_be_bytes(bytes) ^ 0x8000_0000) as i32))
        }
        ShardKeyType::Int64 => Ok(ShardKeyValue::Int64(decode_i64(raw))),
        ShardKeyType::Guid => {
            let mut le = [0u8; 16];
            for (position, &source) in GUID_ORDER.iter().enumerate() {
                le[source] = raw[position];
            }
            Ok(ShardKeyValue::Guid(Uuid::from_bytes_le(le)))
        }
        ShardKeyType::Binary => Ok(ShardKeyValue::Binary(raw.to_vec())),
        ShardKeyType::DateTime => Ok(ShardKeyValue::DateTime(ticks_to_datetime(decode_i64(
            raw,
        ))?)),
        ShardKeyType::DateTimeOffset => {
            let utc = ticks_to_datetime(decode_i64(&raw[..8]))?;
            let offset_ticks = decode_i64(&raw[8..16]);
            if offset_ticks.abs() > MAX_OFFSET_TICKS || offset_ticks % TICKS_PER_SECOND != 0 {
                return Err(Error::invalid_argument(format!(
                    "invalid DateTimeOffset offset of {offset_ticks} ticks"
                )));
            }
            let offset = i32::try_from(offset_ticks / TICKS_PER_SECOND)
                .ok()
                .and_then(FixedOffset::east_opt)
                .ok_or_else(|| {
                    Error::invalid_argument(format!("invalid offset of {offset_ticks} ticks"))
                })?;
            Ok(ShardKeyValue::DateTimeOffset(
                DateTime::from_naive_utc_and_offset(utc, offset),
            ))
        }
        ShardKeyType::TimeSpan => Ok(ShardKeyValue::TimeSpan(ticks_to_duration(decode_i64(
            raw,
        )))),
    }
}

const fn encode_i32(value: i32) -> [u8; 4] {
    ((value as u32) ^ 0x8000_0000).to_be_bytes()
}

const fn encode_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ 0x8000_0000_0000_0000).to_be_bytes()
}

fn decode_i64(raw: &[u8]) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[..8]);
    (u64::from_be_bytes(bytes) ^ 0x8000_0000_0000_0000) as i64
}

fn encode_guid(value: &Uuid) -> [u8; 16] {
    let le = value.to_bytes_le();
    let mut normalized = [0u8; 16];
    for (position, &source) in GUID_ORDER.iter().enumerate() {
        normalized[position] = le[source];
    }
    normalized
}

fn datetime_to_ticks(value: &NaiveDateTime) -> Result<i64> {
    let utc = value.and_utc();
    let ticks = utc
        .timestamp()
        .checked_mul(TICKS_PER_SECOND)
        .and_then(|t| t.checked_add(UNIX_EPOCH_TICKS))
        .and_then(|t| t.checked_add(i64::from(utc.timestamp_subsec_nanos()) / NANOS_PER_TICK))
        .filter(|t| (0..=MAX_DATE_TIME_TICKS).contains(t));
    ticks.ok_or_else(|| {
        Error::invalid_argument(format!(
            "{value} is outside the supported range 0001-01-01..9999-12-31"
        ))
    })
}

fn ticks_to_datetime(ticks: i64) -> Result<NaiveDateTime> {
    if !(0..=MAX_DATE_TIME_TICKS).contains(&ticks) {
        return Err(Error::invalid_argument(format!(
            "{ticks} ticks is outside the DateTime range"
        )));
    }
    let relative = ticks - UNIX_EPOCH_TICKS;
    let seconds = relative.div_euclid(TICKS_PER_SECOND);
    let nanos = (relative.rem_euclid(TICKS_PER_SECOND) * NANOS_PER_TICK) as u32;
    DateTime::from_timestamp(seconds, nanos)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| Error::invalid_argument(format!("{ticks} ticks is not a valid DateTime")))
}

fn duration_to_ticks(value: &Duration) -> Result<i64> {
    let seconds = value.num_seconds();
    let remainder = *value - Duration::seconds(seconds);
    let nanos = remainder.num_nanoseconds().unwrap_or(0);
    seconds
        .checked_mul(TICKS_PER_SECOND)
        .and_then(|t| t.checked_add(nanos / NANOS_PER_TICK))
        .ok_or_else(|| Error::invalid_argument(format!("{value} is outside the TimeSpan range")))
}

fn ticks_to_duration(ticks: i64) -> Duration {
    Duration::seconds(ticks / TICKS_PER_SECOND)
        + Duration::nanoseconds((ticks % TICKS_PER_SECOND) * NANOS_PER_TICK)
}

fn truncate_trailing_zeros(raw: &[u8]) -> &[u8] {
    let len = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &raw[..len]
}

fn pad(raw: &[u8], width: usize) -> Vec<u8> {
    let mut padded = raw.to_vec();
    if padded.len() < width {
        padded.resize(width, 0);
    }
    padded
}

/// Increment as an unsigned big-endian integer; `None` on overflow
fn increment(raw: &[u8]) -> Option<Vec<u8>> {
    let mut next = raw.to_vec();
    for byte in next.iter_mut().rev() {
        let (value, overflow) = byte.overflowing_add(1);
        *byte = value;
        if !overflow {
            return Some(next);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rand::Rng;

    fn all_min_keys() -> Vec<ShardKey> {
        [
            ShardKeyType::Int32,
            ShardKeyType::Int64,
            ShardKeyType::Guid,
            ShardKeyType::Binary,
            ShardKeyType::DateTime,
            ShardKeyType::DateTimeOffset,
            ShardKeyType::TimeSpan,
        ]
        .into_iter()
        .map(ShardKey::min)
        .collect()
    }

    fn sample_keys() -> Vec<ShardKey> {
        let dt = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_nano_opt(13, 45, 1, 123_456_700)
            .unwrap();
        let offset = FixedOffset::east_opt(-5 * 3600).unwrap();
        vec![
            ShardKey::from(0),
            ShardKey::from(-1),
            ShardKey::from(i32::MAX),
            ShardKey::from(42i64),
            ShardKey::from(i64::MIN + 1),
            ShardKey::from(Uuid::new_v4()),
            ShardKey::try_from(vec![1u8, 2, 3]).unwrap(),
            ShardKey::try_from(dt).unwrap(),
            ShardKey::try_from(DateTime::<FixedOffset>::from_naive_utc_and_offset(dt, offset))
                .unwrap(),
            ShardKey::try_from(Duration::milliseconds(-1_500)).unwrap(),
        ]
    }

    #[test]
    fn test_raw_round_trip() {
        for key in sample_keys().into_iter().chain(all_min_keys()) {
            let raw = key.raw_value().unwrap();
            let decoded = ShardKey::from_raw(key.key_type(), raw).unwrap();
            assert_eq!(decoded, key, "round trip of {key}");
            assert_eq!(decoded.value(), key.value(), "value of {key}");
        }
    }

    #[test]
    fn test_trailing_zero_tolerance() {
        for key in sample_keys() {
            if key.key_type() == ShardKeyType::Binary {
                continue;
            }
            let mut raw = key.raw_value().unwrap().to_vec();
            raw.resize(key.key_type().raw_width(), 0);
            let padded = ShardKey::from_raw(key.key_type(), &raw).unwrap();
            assert_eq!(padded, key);
            assert_eq!(padded.value(), key.value());
        }

        let too_long = vec![1u8; 5];
        assert!(ShardKey::from_raw(ShardKeyType::Int32, &too_long).is_err());
    }

    #[test]
    fn test_binary_keys_ignore_trailing_zeros_for_ordering() {
        let short = ShardKey::try_from(vec![7u8]).unwrap();
        let padded = ShardKey::try_from(vec![7u8, 0, 0]).unwrap();
        assert_eq!(short, padded);
        assert_eq!(padded.value(), Some(&ShardKeyValue::Binary(vec![7, 0, 0])));

        let decoded = ShardKey::from_raw(ShardKeyType::Binary, &[7, 0, 0]).unwrap();
        assert_eq!(decoded.value(), Some(&ShardKeyValue::Binary(vec![7, 0, 0])));
        assert!(ShardKey::try_from(vec![0u8; MAX_BINARY_KEY_SIZE + 1]).is_err());
    }

    #[test]
    fn test_integer_ordering_matches_numeric_ordering() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let a: i32 = rng.r#gen();
            let b: i32 = rng.r#gen();
            assert_eq!(ShardKey::from(a).cmp(&ShardKey::from(b)), a.cmp(&b));
            let c: i64 = rng.r#gen();
            let d: i64 = rng.r#gen();
            assert_eq!(ShardKey::from(c).cmp(&ShardKey::from(d)), c.cmp(&d));
        }
    }

    #[test]
    fn test_next_is_strictly_greater() {
        for key in sample_keys().into_iter().chain(all_min_keys()) {
            let next = key.next().unwrap();
            assert!(key < next, "{key} < {next}");
        }
        assert_eq!(ShardKey::from(5).next().unwrap(), ShardKey::from(6));
        assert_eq!(ShardKey::from(-1i64).next().unwrap(), ShardKey::from(0i64));
    }

    #[test]
    fn test_next_at_top_of_domain_is_max() {
        assert!(ShardKey::from(i32::MAX).next().unwrap().is_max());
        assert!(ShardKey::from(i64::MAX).next().unwrap().is_max());
        assert!(ShardKey::from(Uuid::from_bytes([0xFF; 16])).next().unwrap().is_max());
        let binary = ShardKey::try_from(vec![0xFFu8; MAX_BINARY_KEY_SIZE]).unwrap();
        assert!(binary.next().unwrap().is_max());
        let last = NaiveDate::from_ymd_opt(9999, 12, 31)
            .unwrap()
            .and_hms_nano_opt(23, 59, 59, 999_999_900)
            .unwrap();
        assert!(ShardKey::try_from(last).unwrap().next().unwrap().is_max());
    }

    #[test]
    fn test_next_of_max_is_illegal() {
        let err = ShardKey::max(ShardKeyType::Int32).next().unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::IllegalState);
    }

    #[test]
    fn test_binary_next_pads_to_fixed_width() {
        let key = ShardKey::try_from(vec![1u8]).unwrap();
        let next = key.next().unwrap();
        let raw = next.raw_value().unwrap();
        assert_eq!(raw.len(), MAX_BINARY_KEY_SIZE);
        assert_eq!(raw[0], 1);
        assert_eq!(raw[MAX_BINARY_KEY_SIZE - 1], 1);
    }

    #[test]
    fn test_max_sorts_above_everything() {
        let max = ShardKey::max(ShardKeyType::Int32);
        assert!(ShardKey::from(i32::MAX) < max);
        assert_eq!(max, ShardKey::max(ShardKeyType::Int32));
        assert!(max.value().is_none());
        assert!(max.raw_value().is_none());
    }

    #[test]
    fn test_guid_ordering_matches_store_collation() {
        // Descending in the store's uniqueidentifier order
        let descending = [
            "00000000-0000-0000-0000-010000000000",
            "00000000-0000-0000-0000-000000000001",
            "00000000-0000-0000-0100-000000000000",
            "00000000-0000-0000-0001-000000000000",
            "00000000-0000-0001-0000-000000000000",
            "00000000-0000-0100-0000-000000000000",
            "00000000-0001-0000-0000-000000000000",
            "00000000-0100-0000-0000-000000000000",
            "00000001-0000-0000-0000-000000000000",
            "01000000-0000-0000-0000-000000000000",
            "00000000-0000-0000-0000-000000000000",
        ];
        let keys: Vec<ShardKey> = descending
            .iter()
            .map(|s| ShardKey::from(Uuid::parse_str(s).unwrap()))
            .collect();
        for pair in keys.windows(2) {
            assert!(pair[0] > pair[1], "{} > {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_date_time_offset_keeps_offset_on_next() {
        let offset = FixedOffset::east_opt(3600).unwrap();
        let dt = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let key =
            ShardKey::try_from(DateTime::<FixedOffset>::from_naive_utc_and_offset(dt, offset))
                .unwrap();
        let Some(ShardKeyValue::DateTimeOffset(next)) = key.next().unwrap().value().cloned()
        else {
            panic!("expected a DateTimeOffset value");
        };
        assert_eq!(next.offset().local_minus_utc(), 3600);
        assert_eq!(next.naive_utc() - dt, Duration::nanoseconds(100));
    }

    #[test]
    fn test_dynamic_construction() {
        let key = ShardKey::from_dyn(&7i32).unwrap();
        assert_eq!(key.key_type(), ShardKeyType::Int32);
        let key = ShardKey::from_dyn(&vec![1u8, 2]).unwrap();
        assert_eq!(key.key_type(), ShardKeyType::Binary);

        let err = ShardKey::from_dyn(&"text").unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::ArgumentInvalid);
    }

    #[test]
    fn test_serde_round_trip_preserves_binary_value() {
        let key = ShardKey::try_from(vec![9u8, 0]).unwrap();
        let bytes = bincode::serialize(&key).unwrap();
        let back: ShardKey = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.value(), key.value());

        let max = ShardKey::max(ShardKeyType::Guid);
        let bytes = bincode::serialize(&max).unwrap();
        assert!(bincode::deserialize::<ShardKey>(&bytes).unwrap().is_max());
    }
}
