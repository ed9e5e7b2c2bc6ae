//! Canonical content hashing.
//!
//! Every deduplicated entity (molecule, keyword set, specification) derives
//! its identity from a SHA-256 digest over a canonical textual encoding of
//! its scientific content. Floating-point values are rounded before hashing
//! so that equivalent inputs from different producers collapse:
//!
//! - geometries: 1e-8 bohr
//! - keyword values: 1e-10
//! - molecular charge: 1e-4

use serde_json::Value;
use sha2::{Digest, Sha256};

pub const GEOMETRY_DIGITS: usize = 8;
pub const KEYWORD_DIGITS: usize = 10;
pub const CHARGE_DIGITS: usize = 4;

/// Incremental hasher producing a lowercase hex digest.
///
/// Each token is framed with a type tag and length so that adjacent fields
/// cannot alias one another.
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn str(&mut self, s: &str) -> &mut Self {
        self.inner.update(format!("s{}:", s.len()));
        self.inner.update(s.as_bytes());
        self
    }

    pub fn int(&mut self, v: i64) -> &mut Self {
        self.inner.update(format!("i{v};"));
        self
    }

    pub fn float(&mut self, v: f64, digits: usize) -> &mut Self {
        self.inner.update(format!("f{};", format_rounded(v, digits)));
        self
    }

    /// Canonicalize an arbitrary JSON value: object keys are visited in
    /// sorted order, floats are rounded to `digits`.
    pub fn json(&mut self, value: &Value, digits: usize) -> &mut Self {
        match value {
            Value::Null => {
                self.inner.update(b"n;");
            }
            Value::Bool(b) => {
                self.inner.update(if *b { b"b1;".as_ref() } else { b"b0;".as_ref() });
            }
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    self.int(i);
                } else {
                    self.float(n.as_f64().unwrap_or(f64::NAN), digits);
                }
            }
            Value::String(s) => {
                self.str(s);
            }
            Value::Array(items) => {
                self.inner.update(format!("a{}:", items.len()));
                for item in items {
                    self.json(item, digits);
                }
            }
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                self.inner.update(format!("o{}:", keys.len()));
                for key in keys {
                    self.str(key);
                    self.json(&map[key], digits);
                }
            }
        }
        self
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Round to `digits` decimal places, mapping -0.0 onto 0.0.
pub fn round_f64(v: f64, digits: usize) -> f64 {
    let scale = 10f64.powi(digits as i32);
    let r = (v * scale).round() / scale;
    if r == 0.0 {
        0.0
    } else {
        r
    }
}

fn format_rounded(v: f64, digits: usize) -> String {
    if !v.is_finite() {
        return format!("{v}");
    }
    format!("{:.*}", digits, round_f64(v, digits))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn rounding_collapses_noise() {
        let mut a = ContentHasher::new();
        a.float(1.000000001, GEOMETRY_DIGITS);
        let mut b = ContentHasher::new();
        b.float(1.0000000011, GEOMETRY_DIGITS);
        assert_eq!(a.finish(), b.finish());

        let mut a = ContentHasher::new();
        a.float(1.001, GEOMETRY_DIGITS);
        let mut b = ContentHasher::new();
        b.float(1.002, GEOMETRY_DIGITS);
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn negative_zero_is_zero() {
        let mut a = ContentHasher::new();
        a.float(-0.0, GEOMETRY_DIGITS);
        let mut b = ContentHasher::new();
        b.float(0.0, GEOMETRY_DIGITS);
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn json_object_key_order_is_canonical() {
        // serde_json maps are already sorted, so build from differently
        // ordered sources and check the digest is stable.
        let v1: Value = serde_json::from_str(r#"{"b": 1, "a": [1.0, 2.0]}"#).unwrap();
        let v2: Value = serde_json::from_str(r#"{"a": [1.0, 2.0], "b": 1}"#).unwrap();

        let mut h1 = ContentHasher::new();
        h1.json(&v1, KEYWORD_DIGITS);
        let mut h2 = ContentHasher::new();
        h2.json(&v2, KEYWORD_DIGITS);
        assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn json_types_do_not_alias() {
        let mut h1 = ContentHasher::new();
        h1.json(&json!("1"), KEYWORD_DIGITS);
        let mut h2 = ContentHasher::new();
        h2.json(&json!(1), KEYWORD_DIGITS);
        assert_ne!(h1.finish(), h2.finish());
    }
}
