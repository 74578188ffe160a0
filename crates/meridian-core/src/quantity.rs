//! Resource quantities (`250m`, `2`, `512Mi`, `1G`) as integer milli-units.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Resource name (`cpu`, `memory`, …) → quantity.
pub type ResourceList = BTreeMap<String, Quantity>;

/// A resource amount stored in thousandths of the base unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Quantity(i64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn from_units(units: i64) -> Self {
        Self(units.saturating_mul(1000))
    }

    pub fn millis(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_add(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(other.0))
    }

    /// How many whole `per` fit into `self`; zero when `self` is negative.
    pub fn fits(self, per: Quantity) -> u64 {
        if per.0 <= 0 || self.0 <= 0 {
            return 0;
        }
        (self.0 / per.0) as u64
    }
}

/// Multiplier of each suffix, in milli-units.
fn suffix_millis(suffix: &str) -> Option<i128> {
    let m = match suffix {
        "m" => 1,
        "" => 1_000,
        "k" => 1_000_000,
        "M" => 1_000_000_000,
        "G" => 1_000_000_000_000,
        "T" => 1_000_000_000_000_000,
        "Ki" => 1_024 * 1_000,
        "Mi" => 1_024 * 1_024 * 1_000,
        "Gi" => 1_024 * 1_024 * 1_024 * 1_000,
        "Ti" => 1_024 * 1_024 * 1_024 * 1_024 * 1_000,
        _ => return None,
    };
    Some(m)
}

impl FromStr for Quantity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::Quantity(s.to_string());
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);
        if number.is_empty() {
            return Err(invalid());
        }
        let mult = suffix_millis(suffix).ok_or_else(invalid)?;

        let (int_part, frac_part) = match number.split_once('.') {
            Some((i, f)) => (i, f),
            None => (number, ""),
        };
        if frac_part.contains('.') || frac_part.len() > 9 {
            return Err(invalid());
        }
        let int: i128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        let mut millis = int.checked_mul(mult).ok_or_else(invalid)?;
        if !frac_part.is_empty() {
            let frac: i128 = frac_part.parse().map_err(|_| invalid())?;
            let scale = 10i128.pow(frac_part.len() as u32);
            millis += frac * mult / scale;
        }
        i64::try_from(millis).map(Quantity).map_err(|_| invalid())
    }
}

impl TryFrom<String> for Quantity {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Quantity> for String {
    fn from(q: Quantity) -> Self {
        q.to_string()
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

/// Add every entry of `other` into `acc`.
pub fn add_into(acc: &mut ResourceList, other: &ResourceList) {
    for (name, q) in other {
        let slot = acc.entry(name.clone()).or_default();
        *slot = slot.saturating_add(*q);
    }
}

/// Subtract every entry of `other` from `acc`. Missing entries go negative.
pub fn sub_into(acc: &mut ResourceList, other: &ResourceList) {
    for (name, q) in other {
        let slot = acc.entry(name.clone()).or_default();
        *slot = slot.saturating_sub(*q);
    }
}

/// Multiply every entry by `n`.
pub fn scale(list: &ResourceList, n: u32) -> ResourceList {
    list.iter()
        .map(|(k, q)| (k.clone(), Quantity(q.0.saturating_mul(i64::from(n)))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    #[test]
    fn parses_cpu_forms() {
        assert_eq!(q("250m").millis(), 250);
        assert_eq!(q("2").millis(), 2000);
        assert_eq!(q("0.5").millis(), 500);
        assert_eq!(q("1.25").millis(), 1250);
    }

    #[test]
    fn parses_memory_suffixes() {
        assert_eq!(q("1Ki").millis(), 1024 * 1000);
        assert_eq!(q("512Mi").millis(), 512 * 1024 * 1024 * 1000);
        assert_eq!(q("1G").millis(), 1_000_000_000_000);
        assert_eq!(q("2Gi").millis(), 2 * 1024 * 1024 * 1024 * 1000);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Quantity>().is_err());
        assert!("abc".parse::<Quantity>().is_err());
        assert!("1Xi".parse::<Quantity>().is_err());
        assert!("1.2.3".parse::<Quantity>().is_err());
    }

    #[test]
    fn display_prefers_whole_units() {
        assert_eq!(q("4").to_string(), "4");
        assert_eq!(q("1500m").to_string(), "1500m");
    }

    #[test]
    fn fits_counts_whole_multiples() {
        assert_eq!(q("1").fits(q("250m")), 4);
        assert_eq!(q("900m").fits(q("250m")), 3);
        assert_eq!(Quantity::from_millis(-5).fits(q("1")), 0);
        assert_eq!(q("1").fits(Quantity::ZERO), 0);
    }

    #[test]
    fn serde_as_string() {
        let list: ResourceList =
            serde_json::from_str(r#"{"cpu":"500m","memory":"1Gi"}"#).unwrap();
        assert_eq!(list["cpu"].millis(), 500);
        let json = serde_json::to_string(&list).unwrap();
        assert!(json.contains("\"cpu\":\"500m\""));
    }

    #[test]
    fn arithmetic_on_lists() {
        let mut acc = ResourceList::new();
        acc.insert("cpu".into(), q("2"));
        let mut req = ResourceList::new();
        req.insert("cpu".into(), q("500m"));
        req.insert("memory".into(), q("1Mi"));
        sub_into(&mut acc, &req);
        assert_eq!(acc["cpu"], q("1500m"));
        assert!(acc["memory"].millis() < 0);
        add_into(&mut acc, &scale(&req, 2));
        assert_eq!(acc["cpu"], q("2500m"));
    }
}
