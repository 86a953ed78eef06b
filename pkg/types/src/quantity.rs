use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const KI: i64 = 1024;
const MI: i64 = 1024 * 1024;
const GI: i64 = 1024 * 1024 * 1024;
const TI: i64 = 1024 * 1024 * 1024 * 1024;

/// An exact, non-negative resource amount.
///
/// Stored as an integer count of milli-units of the base unit: milli-cores
/// for CPU, thousandths of a byte for memory, milli-counts for GPU. All
/// comparisons and capacity accounting happen on this integer; floating
/// point is only produced on demand for advisory scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Quantity {
    millis: i64,
}

impl Quantity {
    pub const ZERO: Quantity = Quantity { millis: 0 };

    pub fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    /// Whole base units (e.g. cores, bytes).
    pub fn from_units(units: i64) -> Self {
        Self {
            millis: units * 1000,
        }
    }

    pub fn as_millis(self) -> i64 {
        self.millis
    }

    /// Base units as a float. Only for score computation and display math.
    pub fn as_f64(self) -> f64 {
        self.millis as f64 / 1000.0
    }

    pub fn is_zero(self) -> bool {
        self.millis == 0
    }

    pub fn sign(self) -> i8 {
        self.millis.signum() as i8
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.millis.checked_add(other.millis).map(Self::from_millis)
    }

    /// Subtraction that fails on underflow instead of going negative.
    pub fn checked_sub(self, other: Self) -> Option<Self> {
        if other.millis > self.millis {
            None
        } else {
            Some(Self::from_millis(self.millis - other.millis))
        }
    }

    /// Subtraction floored at zero.
    pub fn saturating_sub(self, other: Self) -> Self {
        Self::from_millis((self.millis - other.millis).max(0))
    }
}

impl FromStr for Quantity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            bail!("quantity must not be empty");
        }
        if s.starts_with('-') {
            bail!("quantity '{}' must not be negative", s);
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        // Multiplier from one parsed unit to milli-units.
        let multiplier: i128 = match suffix {
            "" => 1000,
            "m" => 1,
            "Ki" => KI as i128 * 1000,
            "Mi" => MI as i128 * 1000,
            "Gi" => GI as i128 * 1000,
            "Ti" => TI as i128 * 1000,
            other => bail!("quantity '{}' has unknown suffix '{}'", s, other),
        };

        let (mantissa, frac_digits) = parse_fixed_point(number)?;
        let scale = 10i128.pow(frac_digits);
        let scaled = mantissa
            .checked_mul(multiplier)
            .ok_or_else(|| anyhow::anyhow!("quantity '{}' overflows", s))?;
        if scaled % scale != 0 {
            bail!("quantity '{}' is finer than milli precision", s);
        }
        let millis = scaled / scale;
        if millis > i64::MAX as i128 {
            bail!("quantity '{}' overflows", s);
        }
        Ok(Quantity {
            millis: millis as i64,
        })
    }
}

/// Parse a non-negative fixed-point decimal into (mantissa, fractional digits).
fn parse_fixed_point(number: &str) -> anyhow::Result<(i128, u32)> {
    if number.is_empty() {
        bail!("quantity has no numeric part");
    }
    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        bail!("'{}' is not a number", number);
    }
    if frac_part.contains('.') {
        bail!("'{}' has more than one decimal point", number);
    }
    if frac_part.len() > 9 {
        bail!("'{}' has too many fractional digits", number);
    }
    let mut mantissa: i128 = 0;
    for c in int_part.chars().chain(frac_part.chars()) {
        let d = c
            .to_digit(10)
            .ok_or_else(|| anyhow::anyhow!("'{}' is not a number", number))?;
        mantissa = mantissa
            .checked_mul(10)
            .and_then(|m| m.checked_add(d as i128))
            .ok_or_else(|| anyhow::anyhow!("'{}' overflows", number))?;
    }
    Ok((mantissa, frac_part.len() as u32))
}

impl fmt::Display for Quantity {
    /// Canonical shortest form: `m` notation when not a whole number of base
    /// units, otherwise a whole number with the largest exact binary suffix.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.millis == 0 {
            return write!(f, "0");
        }
        if self.millis % 1000 != 0 {
            return write!(f, "{}m", self.millis);
        }
        let whole = self.millis / 1000;
        for (factor, suffix) in [(TI, "Ti"), (GI, "Gi"), (MI, "Mi"), (KI, "Ki")] {
            if whole % factor == 0 {
                return write!(f, "{}{}", whole / factor, suffix);
            }
        }
        write!(f, "{}", whole)
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct QuantityVisitor;

        impl Visitor<'_> for QuantityVisitor {
            type Value = Quantity;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a quantity string like \"2\", \"500m\", or \"4Gi\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Quantity, E> {
                v.parse().map_err(de::Error::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quantity, E> {
                if v > (i64::MAX / 1000) as u64 {
                    return Err(de::Error::custom("quantity overflows"));
                }
                Ok(Quantity::from_units(v as i64))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quantity, E> {
                if v < 0 {
                    return Err(de::Error::custom("quantity must not be negative"));
                }
                self.visit_u64(v as u64)
            }
        }

        deserializer.deserialize_any(QuantityVisitor)
    }
}
