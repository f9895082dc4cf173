//! Parameter Fingerprinting
//!
//! Canonical SHA256 digests of tool-call parameters, used as the content part
//! of every cache and call-history key.
//!
//! Canonical form:
//! - map keys sorted at every depth, list order preserved
//! - every scalar carries a type tag, so `100`, `100.0`, `"100"` and `true`
//!   never collide
//! - strings are length-prefixed, so separators inside values cannot forge
//!   structure
//! - absent input, `null` and `{}` all canonicalize to the empty string
//!
//! Everything here is a pure function of its input.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Parameter value model for hashing
///
/// Mirrors JSON but keeps integers and floats apart and can represent the
/// non-finite floats JSON cannot.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i128),
    Float(f64),
    String(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    /// Build a map value from key/value pairs (order irrelevant)
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ParamValue)>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// True for the values normalized to "no parameters"
    pub fn is_empty_structure(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Map(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Canonical encoding of this value (no top-level normalization)
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }

    /// Fingerprint of this value
    pub fn fingerprint(&self) -> String {
        fingerprint(Some(self))
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            Self::Null => out.push_str("null"),
            Self::Bool(b) => out.push_str(if *b { "b:true" } else { "b:false" }),
            Self::Int(i) => {
                let _ = write!(out, "i:{}", i);
            }
            Self::Float(f) => {
                out.push_str("f:");
                out.push_str(&float_token(*f));
            }
            Self::String(s) => write_str(out, s),
            Self::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.write_canonical(out);
                }
                out.push(']');
            }
            Self::Map(map) => {
                // BTreeMap iterates in byte-lexicographic key order
                out.push('{');
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_str(out, key);
                    out.push('=');
                    value.write_canonical(out);
                }
                out.push('}');
            }
        }
    }
}

fn write_str(out: &mut String, s: &str) {
    let _ = write!(out, "s{}:{}", s.len(), s);
}

/// Stable token for a float, distinct for each special value
fn float_token(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "+inf" } else { "-inf" }.to_string()
    } else if f == 0.0 {
        if f.is_sign_negative() { "-0" } else { "+0" }.to_string()
    } else {
        // Debug output is the shortest round-trip representation
        format!("{:?}", f)
    }
}

impl From<&Value> for ParamValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i as i128)
                } else if let Some(u) = n.as_u64() {
                    Self::Int(u as i128)
                } else {
                    n.as_f64().map_or(Self::Null, Self::Float)
                }
            }
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => Self::List(items.iter().map(Self::from).collect()),
            Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        Self::from(&value)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        Self::Int(i as i128)
    }
}

impl From<f64> for ParamValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<ParamValue>> for ParamValue {
    fn from(items: Vec<ParamValue>) -> Self {
        Self::List(items)
    }
}

/// Canonical encoding with boundary normalization applied
pub fn canonicalize(params: Option<&ParamValue>) -> String {
    match params {
        None => String::new(),
        Some(value) if value.is_empty_structure() => String::new(),
        Some(value) => value.canonical(),
    }
}

/// Fingerprint parameters
///
/// Returns the 64-char lowercase hex SHA256 of the canonical encoding.
pub fn fingerprint(params: Option<&ParamValue>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(params).as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint JSON parameters
pub fn fingerprint_json(params: Option<&Value>) -> String {
    let converted = params.map(ParamValue::from);
    fingerprint(converted.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_absent_and_empty_match_empty_digest() {
        assert_eq!(fingerprint(None), EMPTY_SHA256);
        assert_eq!(fingerprint(Some(&ParamValue::Map(BTreeMap::new()))), EMPTY_SHA256);
        assert_eq!(fingerprint(Some(&ParamValue::Null)), EMPTY_SHA256);
        assert_eq!(fingerprint_json(None), EMPTY_SHA256);
        assert_eq!(fingerprint_json(Some(&json!({}))), EMPTY_SHA256);
    }

    #[test]
    fn test_digest_shape() {
        let fp = fingerprint_json(Some(&json!({"query": "orders", "limit": 10})));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"b": 2, "a": 1, "c": {"y": [1, 2], "x": null}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"c": {"x": null, "y": [1, 2]}, "a": 1, "b": 2}"#).unwrap();
        assert_eq!(fingerprint_json(Some(&a)), fingerprint_json(Some(&b)));
    }

    #[test]
    fn test_list_order_sensitive() {
        let a = json!({"ids": [1, 2, 3]});
        let b = json!({"ids": [3, 2, 1]});
        assert_ne!(fingerprint_json(Some(&a)), fingerprint_json(Some(&b)));
    }

    #[test]
    fn test_logical_types_never_collide() {
        let number = json!({"quantity": 100});
        let string = json!({"quantity": "100"});
        let float = json!({"quantity": 100.0});
        assert_ne!(fingerprint_json(Some(&number)), fingerprint_json(Some(&string)));
        assert_ne!(fingerprint_json(Some(&number)), fingerprint_json(Some(&float)));

        let falsy = json!({"flag": false});
        let zero = json!({"flag": 0});
        let null = json!({"flag": null});
        assert_ne!(fingerprint_json(Some(&falsy)), fingerprint_json(Some(&zero)));
        assert_ne!(fingerprint_json(Some(&falsy)), fingerprint_json(Some(&null)));
    }

    #[test]
    fn test_special_floats_distinct_and_stable() {
        let values = [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -0.0, 0.0, 1.5];
        let prints: Vec<String> = values
            .iter()
            .map(|f| ParamValue::map([("v", ParamValue::Float(*f))]).fingerprint())
            .collect();

        for i in 0..prints.len() {
            for j in (i + 1)..prints.len() {
                assert_ne!(prints[i], prints[j], "{} vs {}", values[i], values[j]);
            }
        }

        let again = ParamValue::map([("v", ParamValue::Float(f64::NAN))]).fingerprint();
        assert_eq!(prints[0], again);
    }

    #[test]
    fn test_length_prefix_blocks_forged_structure() {
        let joined = ParamValue::map([("k", ParamValue::List(vec!["a,s1:b".into()]))]);
        let split = ParamValue::map([("k", ParamValue::List(vec!["a".into(), "b".into()]))]);
        assert_ne!(joined.fingerprint(), split.fingerprint());
    }

    #[test]
    fn test_json_and_model_agree() {
        let from_json = fingerprint_json(Some(&json!({"city": "Berlin", "days": 3, "metric": true})));
        let built = ParamValue::map([
            ("metric", ParamValue::Bool(true)),
            ("days", ParamValue::from(3i64)),
            ("city", ParamValue::from("Berlin")),
        ]);
        assert_eq!(from_json, built.fingerprint());
    }

    #[test]
    fn test_nested_empty_map_not_normalized() {
        let nested = json!({"filter": {}});
        assert_ne!(fingerprint_json(Some(&nested)), EMPTY_SHA256);
        assert_eq!(ParamValue::from(&nested).canonical(), "{s6:filter={}}");
    }

    #[test]
    fn test_concurrent_callers_agree() {
        let params = json!({"sku": "A-1", "qty": 4, "tags": ["x", "y"]});
        let expected = fingerprint_json(Some(&params));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let params = params.clone();
                std::thread::spawn(move || fingerprint_json(Some(&params)))
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }
}
