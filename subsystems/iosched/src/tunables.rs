//! # Run-time Tunables
//!
//! Each policy exposes a fixed table of bounded integer attributes. Writes
//! arrive as decimal text, are clamped to `[min, max]`, and are rejected
//! outright (previous value kept) when they do not parse.

use crate::error::{IoSchedError, IoSchedResult};

/// One named, bounded attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunableDef {
    /// Attribute name
    pub name: &'static str,
    /// Smallest accepted value
    pub min: u64,
    /// Largest accepted value
    pub max: u64,
}

impl TunableDef {
    /// Declare an attribute
    pub const fn new(name: &'static str, min: u64, max: u64) -> Self {
        Self { name, min, max }
    }

    /// Clamp into range
    #[inline]
    pub fn clamp(&self, value: u64) -> u64 {
        value.clamp(self.min, self.max)
    }
}

/// A set of tunables backed by a plain struct
pub trait TunableSet {
    /// Attribute table, index-aligned with `load`/`store`
    const DEFS: &'static [TunableDef];

    /// Read attribute `idx`
    fn load(&self, idx: usize) -> u64;

    /// Write attribute `idx` (already clamped)
    fn store(&mut self, idx: usize, value: u64);

    /// Read by name
    fn get(&self, name: &str) -> IoSchedResult<u64> {
        let idx = lookup(Self::DEFS, name)?;
        Ok(self.load(idx))
    }

    /// Write a numeric value by name; returns the value actually stored
    fn set(&mut self, name: &str, value: u64) -> IoSchedResult<u64> {
        let idx = lookup(Self::DEFS, name)?;
        let stored = Self::DEFS[idx].clamp(value);
        self.store(idx, stored);
        Ok(stored)
    }

    /// Write decimal text by name; returns the value actually stored
    fn store_str(&mut self, name: &str, input: &str) -> IoSchedResult<u64> {
        let idx = lookup(Self::DEFS, name)?;
        let value = parse_value(input)?;
        let stored = Self::DEFS[idx].clamp(value);
        self.store(idx, stored);
        Ok(stored)
    }
}

/// Find `name` in `defs`
pub fn lookup(defs: &[TunableDef], name: &str) -> IoSchedResult<usize> {
    defs.iter()
        .position(|def| def.name == name)
        .ok_or(IoSchedError::UnknownTunable)
}

/// Parse a decimal attribute value, tolerating surrounding whitespace.
///
/// Negative numbers clamp to zero like any other out-of-range value.
pub fn parse_value(input: &str) -> IoSchedResult<u64> {
    let text = input.trim();
    if let Some(rest) = text.strip_prefix('-') {
        return match rest.parse::<u64>() {
            Ok(_) => Ok(0),
            Err(_) => Err(IoSchedError::InvalidTunableValue),
        };
    }
    text.parse::<u64>()
        .map_err(|_| IoSchedError::InvalidTunableValue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Pair {
        a: u64,
        b: u64,
    }

    impl TunableSet for Pair {
        const DEFS: &'static [TunableDef] = &[TunableDef::new("a", 1, 10), TunableDef::new("b", 0, 1)];

        fn load(&self, idx: usize) -> u64 {
            match idx {
                0 => self.a,
                _ => self.b,
            }
        }

        fn store(&mut self, idx: usize, value: u64) {
            match idx {
                0 => self.a = value,
                _ => self.b = value,
            }
        }
    }

    #[test]
    fn test_clamped_on_write() {
        let mut pair = Pair::default();
        assert_eq!(pair.set("a", 50), Ok(10));
        assert_eq!(pair.store_str("a", "0\n"), Ok(1));
        assert_eq!(pair.store_str("b", "-3"), Ok(0));
        assert_eq!(pair.get("a"), Ok(1));
    }

    #[test]
    fn test_rejected_write_keeps_value() {
        let mut pair = Pair::default();
        pair.set("a", 5).unwrap();
        assert_eq!(pair.store_str("a", "five"), Err(IoSchedError::InvalidTunableValue));
        assert_eq!(pair.get("a"), Ok(5));
        assert_eq!(pair.set("c", 1), Err(IoSchedError::UnknownTunable));
    }
}
