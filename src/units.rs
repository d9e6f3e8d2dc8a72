use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const DECIMAL_UNITS: [(&str, u64); 4] = [
    ("KB", 1_000),
    ("MB", 1_000_000),
    ("GB", 1_000_000_000),
    ("TB", 1_000_000_000_000),
];

const BINARY_UNITS: [(&str, u64); 4] = [
    ("KiB", 1 << 10),
    ("MiB", 1 << 20),
    ("GiB", 1 << 30),
    ("TiB", 1 << 40),
];

/// A byte quantity that deserializes from either a bare integer or a
/// human-readable string such as `"512MiB"` or `"2.5GB"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const fn bytes(&self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(anyhow!("not a valid byte quantity: empty value"));
        }

        let split = value
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(value.len());
        let (number, unit) = value.split_at(split);
        let unit = unit.trim_start();

        let multiplier = match unit {
            "" | "B" => None,
            _ => Some(
                BINARY_UNITS
                    .iter()
                    .chain(DECIMAL_UNITS.iter())
                    .find(|(name, _)| *name == unit)
                    .map(|(_, factor)| *factor)
                    .ok_or_else(|| anyhow!("not a valid byte quantity: unknown unit '{unit}'"))?,
            ),
        };

        match multiplier {
            None => {
                // Fractional bytes make no sense without a unit.
                let bytes = number
                    .parse::<u64>()
                    .map_err(|err| anyhow!("not a valid byte quantity '{value}': {err}"))?;
                Ok(Self(bytes))
            }
            Some(factor) => {
                let quantity = number
                    .parse::<f64>()
                    .map_err(|err| anyhow!("not a valid byte quantity '{value}': {err}"))?;
                if !quantity.is_finite() || quantity < 0.0 {
                    return Err(anyhow!("not a valid byte quantity '{value}'"));
                }
                Ok(Self((quantity * factor as f64) as u64))
            }
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        for (name, factor) in BINARY_UNITS.iter().rev() {
            if bytes >= *factor {
                let scaled = bytes as f64 / *factor as f64;
                if scaled.fract() == 0.0 {
                    return write!(f, "{scaled:.0}{name}");
                }
                return write!(f, "{scaled:.1}{name}");
            }
        }
        write!(f, "{bytes}B")
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ByteSizeVisitor;

        impl Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte count or a string such as \"512MiB\"")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(ByteSize(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                u64::try_from(value)
                    .map(ByteSize)
                    .map_err(|_| E::custom("byte quantity must not be negative"))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_integers() {
        assert_eq!("1024".parse::<ByteSize>().unwrap(), ByteSize(1024));
        assert_eq!("0".parse::<ByteSize>().unwrap(), ByteSize(0));
    }

    #[test]
    fn parses_decimal_units() {
        assert_eq!("1KB".parse::<ByteSize>().unwrap(), ByteSize(1_000));
        assert_eq!("2.5GB".parse::<ByteSize>().unwrap(), ByteSize(2_500_000_000));
    }

    #[test]
    fn parses_binary_units() {
        assert_eq!("1KiB".parse::<ByteSize>().unwrap(), ByteSize(1024));
        assert_eq!("10GiB".parse::<ByteSize>().unwrap(), ByteSize(10 << 30));
    }

    #[test]
    fn accepts_whitespace_between_number_and_unit() {
        assert_eq!("5 MiB".parse::<ByteSize>().unwrap(), ByteSize(5 << 20));
    }

    #[test]
    fn rejects_invalid_forms() {
        assert!("".parse::<ByteSize>().is_err());
        assert!("12XB".parse::<ByteSize>().is_err());
        assert!("1.5".parse::<ByteSize>().is_err());
        assert!("-3MB".parse::<ByteSize>().is_err());
    }

    #[test]
    fn displays_in_human_form() {
        assert_eq!(ByteSize(512).to_string(), "512B");
        assert_eq!(ByteSize(1024).to_string(), "1KiB");
        assert_eq!(ByteSize(10 << 30).to_string(), "10GiB");
        assert_eq!(ByteSize(1536).to_string(), "1.5KiB");
    }
}
