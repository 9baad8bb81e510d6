//! Byte quantities and scaled ratios in Kubernetes quantity notation
//!
//! Status fields travel as size strings (`"50Gi"`, `"50GiB"`, `"1500M"`)
//! but are compared and summed as exact byte counts. Parsing never rounds:
//! a literal that does not resolve to a whole number of bytes is rejected.

use std::fmt;
use std::str::FromStr;

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// Multipliers for every accepted suffix, longest first so `GiB` wins over `Gi`
const SUFFIXES: &[(&str, u128)] = &[
    ("KiB", 1 << 10),
    ("MiB", 1 << 20),
    ("GiB", 1 << 30),
    ("TiB", 1 << 40),
    ("PiB", 1 << 50),
    ("EiB", 1 << 60),
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

/// Binary suffixes used when formatting, largest first
const FORMAT_SUFFIXES: &[(&str, u32)] = &[
    ("Ei", 60),
    ("Pi", 50),
    ("Ti", 40),
    ("Gi", 30),
    ("Mi", 20),
    ("Ki", 10),
];

/// Longest fractional part accepted before the value is considered garbage
const MAX_FRACTION_DIGITS: usize = 30;

/// A decimal literal split into an integer mantissa and a power-of-ten scale
struct Decimal {
    mantissa: u128,
    scale: u32,
}

/// Parse `<digits>[.<digits>]` exactly, trimming trailing fractional zeros
fn parse_decimal(raw: &str, number: &str) -> Result<Decimal, Error> {
    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f.trim_end_matches('0')),
        None => (number, ""),
    };

    if int_part.is_empty() && frac_part.is_empty() && !number.contains('0') {
        return Err(Error::invalid_quantity(raw, "missing numeric value"));
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(Error::invalid_quantity(raw, "expected a non-negative decimal number"));
    }
    if frac_part.len() > MAX_FRACTION_DIGITS {
        return Err(Error::invalid_quantity(raw, "too many fractional digits"));
    }

    let mut mantissa: u128 = 0;
    for c in int_part.chars().chain(frac_part.chars()) {
        let digit = u128::from(c as u8 - b'0');
        mantissa = mantissa
            .checked_mul(10)
            .and_then(|m| m.checked_add(digit))
            .ok_or_else(|| Error::invalid_quantity(raw, "value out of range"))?;
    }

    Ok(Decimal {
        mantissa,
        scale: frac_part.len() as u32,
    })
}

/// Split a literal into its numeric prefix and suffix
fn split_suffix(raw: &str) -> (&str, &str) {
    let idx = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    raw.split_at(idx)
}

/// Exact count of bytes, written as a Kubernetes-style size string
///
/// Accepts plain bytes, decimal (`k M G T P E`), binary (`Ki .. Ei`) and the
/// spelled-out binary forms (`KiB .. EiB`). Always serializes in canonical
/// binary form when the value divides evenly (`53687091200` → `"50Gi"`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteQuantity(u64);

impl ByteQuantity {
    /// Zero bytes
    pub const ZERO: ByteQuantity = ByteQuantity(0);

    /// Wrap an exact byte count
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Exact byte count
    pub const fn bytes(self) -> u64 {
        self.0
    }

    /// `self - other`, clamped at zero
    pub fn saturating_sub(self, other: ByteQuantity) -> ByteQuantity {
        ByteQuantity(self.0.saturating_sub(other.0))
    }

    /// `self + other`, `None` on overflow
    pub fn checked_add(self, other: ByteQuantity) -> Option<ByteQuantity> {
        self.0.checked_add(other.0).map(ByteQuantity)
    }

    /// Parse a size literal into an exact byte count
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if raw.is_empty() {
            return Err(Error::invalid_quantity(raw, "empty quantity"));
        }

        let (number, suffix) = split_suffix(raw);
        if number.is_empty() {
            return Err(Error::invalid_quantity(raw, "missing numeric value"));
        }

        let multiplier = if suffix.is_empty() {
            1
        } else {
            SUFFIXES
                .iter()
                .find(|(s, _)| *s == suffix)
                .map(|(_, m)| *m)
                .ok_or_else(|| {
                    Error::invalid_quantity(raw, format!("unknown suffix '{}'", suffix))
                })?
        };

        let decimal = parse_decimal(raw, number)?;
        let scaled = decimal
            .mantissa
            .checked_mul(multiplier)
            .ok_or_else(|| Error::invalid_quantity(raw, "value out of range"))?;
        let divisor = 10u128.pow(decimal.scale);
        if scaled % divisor != 0 {
            return Err(Error::invalid_quantity(
                raw,
                "does not resolve to a whole number of bytes",
            ));
        }

        u64::try_from(scaled / divisor)
            .map(ByteQuantity)
            .map_err(|_| Error::invalid_quantity(raw, "value out of range"))
    }
}

impl From<u64> for ByteQuantity {
    fn from(bytes: u64) -> Self {
        Self(bytes)
    }
}

impl FromStr for ByteQuantity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ByteQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("0");
        }
        for (suffix, shift) in FORMAT_SUFFIXES {
            let unit = 1u64 << shift;
            if self.0 % unit == 0 {
                return write!(f, "{}{}", self.0 / unit, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

impl Serialize for ByteQuantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Accepts size strings and, as hand-written YAML often has them, bare integers
struct ByteQuantityVisitor;

impl<'de> serde::de::Visitor<'de> for ByteQuantityVisitor {
    type Value = ByteQuantity;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a size string such as \"50Gi\" or a non-negative integer")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
        ByteQuantity::parse(v).map_err(E::custom)
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(ByteQuantity(v))
    }

    fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
        u64::try_from(v)
            .map(ByteQuantity)
            .map_err(|_| E::custom(Error::invalid_quantity(v.to_string(), "negative quantity")))
    }
}

impl<'de> Deserialize<'de> for ByteQuantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ByteQuantityVisitor)
    }
}

impl JsonSchema for ByteQuantity {
    fn schema_name() -> String {
        "ByteQuantity".to_string()
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        string_schema()
    }
}

/// Ratio in `[0, 1]` held at milli precision (`"300m"` is 0.3)
///
/// Mirrors how Kubernetes quantities write fractions. Values are floored
/// to the nearest thousandth when computed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CachedRatio {
    millis: u64,
}

impl CachedRatio {
    /// Zero ratio
    pub const ZERO: CachedRatio = CachedRatio { millis: 0 };

    /// Ratio of `part` to `whole`, zero when `whole` is zero
    pub fn of(part: ByteQuantity, whole: ByteQuantity) -> Self {
        if whole.bytes() == 0 {
            return Self::ZERO;
        }
        let millis = u128::from(part.bytes()) * 1000 / u128::from(whole.bytes());
        Self {
            millis: u64::try_from(millis).unwrap_or(u64::MAX),
        }
    }

    /// Construct from thousandths
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    /// Value in thousandths
    pub const fn millis(self) -> u64 {
        self.millis
    }

    /// Value as a float, for autoscaler thresholds
    pub fn as_f64(self) -> f64 {
        self.millis as f64 / 1000.0
    }

    /// Parse `"300m"`, `"0.3"` or `"1"`
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if raw.is_empty() {
            return Err(Error::invalid_quantity(raw, "empty quantity"));
        }
        let (number, suffix) = split_suffix(raw);
        if number.is_empty() {
            return Err(Error::invalid_quantity(raw, "missing numeric value"));
        }
        let per_unit: u128 = match suffix {
            "" => 1000,
            "m" => 1,
            other => {
                return Err(Error::invalid_quantity(
                    raw,
                    format!("unknown ratio suffix '{}'", other),
                ))
            }
        };

        let decimal = parse_decimal(raw, number)?;
        let scaled = decimal
            .mantissa
            .checked_mul(per_unit)
            .ok_or_else(|| Error::invalid_quantity(raw, "value out of range"))?;
        let divisor = 10u128.pow(decimal.scale);
        if scaled % divisor != 0 {
            return Err(Error::invalid_quantity(raw, "finer than milli precision"));
        }
        u64::try_from(scaled / divisor)
            .map(Self::from_millis)
            .map_err(|_| Error::invalid_quantity(raw, "value out of range"))
    }
}

impl FromStr for CachedRatio {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CachedRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.millis % 1000 == 0 {
            write!(f, "{}", self.millis / 1000)
        } else {
            write!(f, "{}m", self.millis)
        }
    }
}

impl Serialize for CachedRatio {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CachedRatio {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        CachedRatio::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl JsonSchema for CachedRatio {
    fn schema_name() -> String {
        "CachedRatio".to_string()
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        string_schema()
    }
}

fn string_schema() -> Schema {
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::String.into()),
        ..Default::default()
    })
}
