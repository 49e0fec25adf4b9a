//! Canonical ordering, byte encoding and attribute hashing for document
//! values.
//!
//! Documents are self-describing JSON values. Wherever the server needs a
//! total order over arbitrary values (index entries, range bounds, compare
//! operations) it uses the canonical order defined here:
//!
//!   Null < Bool (false < true) < Number < String < Array < Object
//!
//! Numbers compare numerically regardless of integer/float representation.
//! Arrays compare element-wise with a missing element ranking below every
//! value. Objects compare over the union of their keys in sorted key order,
//! with an absent key ranking as Null.

use std::cmp::Ordering;

use serde_json::{Map, Value};
use xxhash_rust::xxh3::Xxh3;

use crate::error::{HeronError, HeronResult};

/// Relative weight of a value's type in the canonical order.
fn type_weight(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn numeric(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Compare two values in the canonical total order. Returns -1, 0 or 1 like
/// the classic three-way compare the replication wire format expects.
pub fn compare(left: &Value, right: &Value) -> i32 {
    match compare_ord(left, right) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

/// Compare two values, `Ordering`-flavored.
pub fn compare_ord(left: &Value, right: &Value) -> Ordering {
    let lw = type_weight(left);
    let rw = type_weight(right);
    if lw != rw {
        return lw.cmp(&rw);
    }

    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(l), Value::Bool(r)) => l.cmp(r),
        (Value::Number(_), Value::Number(_)) => {
            let l = numeric(left);
            let r = numeric(right);
            l.partial_cmp(&r).unwrap_or(Ordering::Equal)
        }
        (Value::String(l), Value::String(r)) => l.as_bytes().cmp(r.as_bytes()),
        (Value::Array(l), Value::Array(r)) => {
            let n = l.len().max(r.len());
            for i in 0..n {
                match (l.get(i), r.get(i)) {
                    (Some(lv), Some(rv)) => match compare_ord(lv, rv) {
                        Ordering::Equal => continue,
                        other => return other,
                    },
                    // a missing element ranks below every value
                    (None, Some(_)) => return Ordering::Less,
                    (Some(_), None) => return Ordering::Greater,
                    (None, None) => unreachable!(),
                }
            }
            Ordering::Equal
        }
        (Value::Object(l), Value::Object(r)) => compare_objects(l, r),
        _ => unreachable!("type weights already matched"),
    }
}

fn compare_objects(left: &Map<String, Value>, right: &Map<String, Value>) -> Ordering {
    let mut keys: Vec<&String> = left.keys().chain(right.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        let lv = left.get(key.as_str()).unwrap_or(&Value::Null);
        let rv = right.get(key.as_str()).unwrap_or(&Value::Null);
        match compare_ord(lv, rv) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

// ── Order-preserving byte encoding ──────────────────────────────────────────

/// Type tags of the sort-key encoding. Chosen so that plain byte comparison
/// of encoded values matches `compare_ord`.
const TAG_NULL: u8 = 0x02;
const TAG_BOOL: u8 = 0x03;
const TAG_NUMBER: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_ARRAY: u8 = 0x06;
const TAG_OBJECT: u8 = 0x07;

/// Sorts below the encoding of every value. Used by range bounds.
pub const VALUE_MIN: u8 = 0x01;
/// Sorts above the encoding of every value. Used by range bounds.
pub const VALUE_MAX: u8 = 0xfb;

/// Encode a value such that lexicographic byte order of the encodings equals
/// the canonical value order. The encoding is self-delimiting, so encoded
/// values can be concatenated (compound index entries, object members).
pub fn sort_key_bytes(v: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    write_sort_key(v, &mut out);
    out
}

fn write_sort_key(v: &Value, out: &mut Vec<u8>) {
    match v {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::Number(_) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&encode_f64(numeric(v)));
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            write_terminated(s.as_bytes(), out);
        }
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            for item in items {
                write_sort_key(item, out);
            }
            out.push(0x00);
        }
        Value::Object(map) => {
            out.push(TAG_OBJECT);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                out.push(TAG_STRING);
                write_terminated(key.as_bytes(), out);
                write_sort_key(&map[key.as_str()], out);
            }
            out.push(0x00);
        }
    }
}

/// NUL bytes inside the payload are escaped as `0x00 0xff` so that the bare
/// `0x00` terminator stays unambiguous and shorter strings sort first.
fn write_terminated(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        out.push(b);
        if b == 0x00 {
            out.push(0xff);
        }
    }
    out.push(0x00);
}

/// Map an f64 onto bytes whose lexicographic order matches numeric order:
/// positive values get the sign bit flipped, negative values are inverted
/// entirely.
fn encode_f64(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let ordered = if bits & (1 << 63) == 0 {
        bits ^ (1 << 63)
    } else {
        !bits
    };
    ordered.to_be_bytes()
}

// ── Sharding-attribute hashing ──────────────────────────────────────────────

/// Hash the named attributes of a document, order-independently.
///
/// The canonical form is: sort the attribute names, then for each attribute
/// feed its name and the sort-key encoding of its value into the hash. A
/// missing attribute hashes as Null, unless `strict` is set, in which case it
/// is an error.
pub fn attribute_hash(doc: &Value, attributes: &[String], strict: bool) -> HeronResult<u64> {
    let obj = doc
        .as_object()
        .ok_or_else(|| HeronError::BadParameter("expecting a document".into()))?;

    let mut names: Vec<&String> = attributes.iter().collect();
    names.sort();
    names.dedup();

    let mut hasher = Xxh3::new();
    for name in names {
        let value = match obj.get(name.as_str()) {
            Some(v) => v,
            None if strict => return Err(HeronError::ShardingAttributesMissing),
            None => &Value::Null,
        };
        hasher.update(name.as_bytes());
        hasher.update(&[0x00]);
        hasher.update(&sort_key_bytes(value));
    }
    Ok(hasher.digest())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cmp_json(l: &str, r: &str) -> i32 {
        let lv: Value = serde_json::from_str(l).unwrap();
        let rv: Value = serde_json::from_str(r).unwrap();
        compare(&lv, &rv)
    }

    #[test]
    fn test_compare_equal_values() {
        for v in [
            "null", "false", "true", "0", "1", "1.5", "-43.2", "\"\"", "\" \"",
            "\"the quick brown fox\"", "[]", "[-1]", "[0]", "[1]", "[true]", "{}",
        ] {
            assert_eq!(0, cmp_json(v, v), "{v} should equal itself");
        }
    }

    #[test]
    fn test_compare_type_order() {
        assert_eq!(-1, cmp_json("null", "false"));
        assert_eq!(-1, cmp_json("null", "true"));
        assert_eq!(-1, cmp_json("null", "-1"));
        assert_eq!(-1, cmp_json("null", "\"\""));
        assert_eq!(-1, cmp_json("null", "[]"));
        assert_eq!(-1, cmp_json("false", "true"));
        assert_eq!(-1, cmp_json("true", "0"));
        assert_eq!(-1, cmp_json("99", "\"-1\""), "numbers precede strings");
        assert_eq!(-1, cmp_json("1", "\"-1\""));
        assert_eq!(-1, cmp_json("\"zzz\"", "[]"));
        assert_eq!(-1, cmp_json("[999]", "{}"));
        assert_eq!(1, cmp_json("\"0\"", "0"));
    }

    #[test]
    fn test_compare_numbers() {
        assert_eq!(-1, cmp_json("-1", "0"));
        assert_eq!(-1, cmp_json("0", "0.5"));
        assert_eq!(-1, cmp_json("1", "2"));
        assert_eq!(0, cmp_json("1", "1.0"));
        assert_eq!(1, cmp_json("100", "99.9"));
    }

    #[test]
    fn test_compare_arrays_elementwise() {
        assert_eq!(-1, cmp_json("[]", "[null]"));
        assert_eq!(-1, cmp_json("[1]", "[2]"));
        assert_eq!(-1, cmp_json("[1]", "[1, 0]"), "prefix sorts first");
        assert_eq!(0, cmp_json("[1, \"a\"]", "[1, \"a\"]"));
        assert_eq!(1, cmp_json("[1, 2]", "[1]"));
    }

    #[test]
    fn test_compare_objects_by_key_union() {
        assert_eq!(0, cmp_json("{\"a\":1,\"b\":2}", "{\"b\":2,\"a\":1}"));
        assert_eq!(-1, cmp_json("{\"a\":1}", "{\"a\":2}"));
        // absent key ranks as null, so {} < {"a": 1} but {} == {"a": null}
        assert_eq!(-1, cmp_json("{}", "{\"a\":1}"));
        assert_eq!(0, cmp_json("{}", "{\"a\":null}"));
    }

    #[test]
    fn test_sort_key_order_matches_compare() {
        let values: Vec<Value> = vec![
            json!(null),
            json!(false),
            json!(true),
            json!(-10.5),
            json!(-1),
            json!(0),
            json!(1),
            json!(2.5),
            json!(1000),
            json!(""),
            json!("a"),
            json!("a\u{0}b"),
            json!("ab"),
            json!("b"),
            json!([]),
            json!([1]),
            json!([1, 2]),
            json!([2]),
            json!({}),
            json!({"a": 1}),
        ];
        for (i, l) in values.iter().enumerate() {
            for (j, r) in values.iter().enumerate() {
                let byte_order = sort_key_bytes(l).cmp(&sort_key_bytes(r));
                assert_eq!(
                    byte_order,
                    compare_ord(l, r),
                    "byte order diverges for {l} vs {r} ({i}, {j})"
                );
            }
        }
    }

    #[test]
    fn test_sort_key_within_sentinels() {
        for v in [json!(null), json!(12), json!("zzz"), json!([1, 2, 3]), json!({"k": true})] {
            let enc = sort_key_bytes(&v);
            assert!(enc.as_slice() > [VALUE_MIN].as_slice());
            assert!(enc.as_slice() < [VALUE_MAX].as_slice());
        }
    }

    #[test]
    fn test_attribute_hash_order_independent() {
        let doc = json!({"city": "cologne", "user": "alice", "age": 42});
        let h1 = attribute_hash(&doc, &["user".into(), "city".into()], true).unwrap();
        let h2 = attribute_hash(&doc, &["city".into(), "user".into()], true).unwrap();
        assert_eq!(h1, h2);

        let other = json!({"city": "berlin", "user": "alice"});
        let h3 = attribute_hash(&other, &["city".into(), "user".into()], true).unwrap();
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_attribute_hash_missing_attribute() {
        let doc = json!({"user": "alice"});
        // lenient: missing hashes as null
        let lenient = attribute_hash(&doc, &["user".into(), "city".into()], false).unwrap();
        let with_null = attribute_hash(
            &json!({"user": "alice", "city": null}),
            &["user".into(), "city".into()],
            false,
        )
        .unwrap();
        assert_eq!(lenient, with_null);

        // strict: error
        let err = attribute_hash(&doc, &["user".into(), "city".into()], true).unwrap_err();
        assert_eq!(err.code(), 1581);
    }

    #[test]
    fn test_attribute_hash_rejects_non_object() {
        assert!(attribute_hash(&json!([1, 2]), &["a".into()], false).is_err());
    }
}
