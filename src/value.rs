//! A typed value tree that carries configuration, RPC payloads, resume
//! data, and tracker responses, with round-trip JSON and bencode codecs.
//!
//! Map keys are interned [`Quark`](crate::quark::Quark) ids rather than
//! strings, so the same map can be walked by the RPC dispatcher's field
//! projection without re-hashing byte strings on every request. Iteration
//! order is insertion order; bencode encoding re-sorts keys into
//! byte-lexical order at encode time only, since BEP 3 requires it on the
//! wire but nothing about in-memory iteration does.

use crate::quark::{self, Quark};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(Vec<u8>),
    List(Vec<Value>),
    Map(ValueMap),
}

/// An insertion-ordered map keyed by quark id. Inserting an existing key
/// overwrites its value in place (insert-or-assign); it never creates a
/// duplicate entry.
#[derive(Debug, Clone, Default)]
pub struct ValueMap {
    order: Vec<Quark>,
    entries: std::collections::HashMap<Quark, Value>,
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: Quark, value: Value) -> &mut Self {
        if !self.entries.contains_key(&key) {
            self.order.push(key);
        }
        self.entries.insert(key, value);
        self
    }

    pub fn insert_str(&mut self, key: &str, value: Value) -> &mut Self {
        self.insert(quark::intern_str(key), value)
    }

    pub fn get(&self, key: Quark) -> Option<&Value> {
        self.entries.get(&key)
    }

    /// Looks the key up, then falls back to its legacy alias (camelCase
    /// <-> snake_case) if the literal key is absent.
    pub fn get_aliased(&self, key: Quark) -> Option<&Value> {
        self.entries
            .get(&key)
            .or_else(|| self.entries.get(&quark::convert(key)))
    }

    pub fn remove(&mut self, key: Quark) -> Option<Value> {
        if let Some(pos) = self.order.iter().position(|&k| k == key) {
            self.order.remove(pos);
        }
        self.entries.remove(&key)
    }

    pub fn contains_key(&self, key: Quark) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Quark, &Value)> {
        self.order.iter().map(move |k| (*k, self.entries.get(k).unwrap()))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut ValueMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::Str(s.into().into_bytes())
    }

    pub fn map() -> Value {
        Value::Map(ValueMap::new())
    }

    pub fn list() -> Value {
        Value::List(Vec::new())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::string(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::string(v)
    }
}

// ---------------------------------------------------------------------
// bencode
// ---------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    Eof,
    #[error("invalid bencode syntax at offset {0}")]
    Syntax(usize),
}

/// Bencode has only int/string/list/dict. `Null`, `Bool`, and `Double` are
/// wire-represented as a byte string carrying a two-byte private tag (for
/// `Null`/`Bool`) or a tag plus the value's raw IEEE-754 bits (for `Double`),
/// so they still round-trip exactly through this crate's own bencode codec
/// (resume files, internal config) without losing precision to a decimal
/// rendering. Real `.torrent` files and tracker responses never contain
/// these tagged byte sequences, so decoding is unambiguous in practice.
const EXT_MARKER: u8 = 0x01;
const EXT_NULL: u8 = b'n';
const EXT_TRUE: u8 = b't';
const EXT_FALSE: u8 = b'f';
const EXT_DOUBLE: u8 = b'd';

fn encode_bytes_field(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

/// Encodes a value as bencode. Dictionary keys are always emitted in
/// byte-lexical order, independent of the map's insertion order, because
/// announce responses and `.torrent` files require it.
pub fn bencode_encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => encode_bytes_field(&[EXT_MARKER, EXT_NULL], out),
        Value::Bool(b) => {
            encode_bytes_field(&[EXT_MARKER, if *b { EXT_TRUE } else { EXT_FALSE }], out)
        }
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Double(d) => {
            let mut payload = vec![EXT_MARKER, EXT_DOUBLE];
            payload.extend_from_slice(&d.to_bits().to_be_bytes());
            encode_bytes_field(&payload, out);
        }
        Value::Str(s) => encode_bytes_field(s, out),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Map(map) => {
            out.push(b'd');
            let mut keys: Vec<(Box<[u8]>, &Value)> =
                map.iter().map(|(k, v)| (quark::get(k), v)).collect();
            keys.sort_by(|a, b| a.0.cmp(&b.0));
            for (key_bytes, v) in &keys {
                encode_bytes_field(key_bytes, out);
                encode_into(v, out);
            }
            out.push(b'e');
        }
    }
}

pub fn bencode_decode(bytes: &[u8]) -> Result<Value, BencodeError> {
    let mut pos = 0;
    let value = decode_value(bytes, &mut pos)?;
    Ok(value)
}

fn decode_value(bytes: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    match bytes.get(*pos) {
        None => Err(BencodeError::Eof),
        Some(b'i') => decode_int(bytes, pos),
        Some(b'l') => decode_list(bytes, pos),
        Some(b'd') => decode_map(bytes, pos),
        Some(c) if c.is_ascii_digit() => decode_string(bytes, pos),
        Some(_) => Err(BencodeError::Syntax(*pos)),
    }
}

fn decode_int(bytes: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    *pos += 1; // 'i'
    let start = *pos;
    while bytes.get(*pos) != Some(&b'e') {
        *pos += 1;
        if *pos > bytes.len() {
            return Err(BencodeError::Eof);
        }
    }
    let s = std::str::from_utf8(&bytes[start..*pos]).map_err(|_| BencodeError::Syntax(start))?;
    let i: i64 = s.parse().map_err(|_| BencodeError::Syntax(start))?;
    *pos += 1; // 'e'
    Ok(Value::Int(i))
}

/// Reads one length-prefixed bencode byte string, without interpreting the
/// `Null`/`Bool`/`Double` extension tag. Used for dict keys, which are
/// always plain field names.
fn decode_raw_string(bytes: &[u8], pos: &mut usize) -> Result<Vec<u8>, BencodeError> {
    let start = *pos;
    while bytes.get(*pos) != Some(&b':') {
        *pos += 1;
        if *pos > bytes.len() {
            return Err(BencodeError::Eof);
        }
    }
    let len: usize = std::str::from_utf8(&bytes[start..*pos])
        .map_err(|_| BencodeError::Syntax(start))?
        .parse()
        .map_err(|_| BencodeError::Syntax(start))?;
    *pos += 1; // ':'
    if *pos + len > bytes.len() {
        return Err(BencodeError::Eof);
    }
    let s = bytes[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(s)
}

/// Decodes the extension tag (see `encode_into`'s `Value::Null`/`Bool`/
/// `Double` arms) out of a raw byte string, falling back to a plain string
/// value when the bytes don't match a tag exactly.
fn untag_extension(raw: Vec<u8>) -> Value {
    if raw.len() == 2 && raw[0] == EXT_MARKER {
        match raw[1] {
            EXT_NULL => return Value::Null,
            EXT_TRUE => return Value::Bool(true),
            EXT_FALSE => return Value::Bool(false),
            _ => {}
        }
    }
    if raw.len() == 10 && raw[0] == EXT_MARKER && raw[1] == EXT_DOUBLE {
        let bits = u64::from_be_bytes(raw[2..10].try_into().unwrap());
        return Value::Double(f64::from_bits(bits));
    }
    Value::Str(raw)
}

fn decode_string(bytes: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    decode_raw_string(bytes, pos).map(untag_extension)
}

fn decode_list(bytes: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    *pos += 1; // 'l'
    let mut items = Vec::new();
    loop {
        match bytes.get(*pos) {
            None => return Err(BencodeError::Eof),
            Some(b'e') => {
                *pos += 1;
                break;
            }
            _ => items.push(decode_value(bytes, pos)?),
        }
    }
    Ok(Value::List(items))
}

fn decode_map(bytes: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    *pos += 1; // 'd'
    let mut map = ValueMap::new();
    loop {
        match bytes.get(*pos) {
            None => return Err(BencodeError::Eof),
            Some(b'e') => {
                *pos += 1;
                break;
            }
            _ => {
                let key = decode_raw_string(bytes, pos)?;
                let val = decode_value(bytes, pos)?;
                map.insert(quark::intern(&key), val);
            }
        }
    }
    Ok(Value::Map(map))
}

// ---------------------------------------------------------------------
// JSON (RFC 8259)
// ---------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum JsonError {
    #[error("unexpected end of input")]
    Eof,
    #[error("invalid json syntax at offset {0}")]
    Syntax(usize),
    #[error("invalid utf-8 in json string")]
    InvalidUtf8,
}

pub fn json_encode(value: &Value) -> String {
    let mut out = String::new();
    json_encode_into(value, &mut out);
    out
}

fn json_encode_into(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Double(d) => {
            if d.is_finite() {
                let rendered = d.to_string();
                if rendered.contains('.') || rendered.contains('e') || rendered.contains('E') {
                    out.push_str(&rendered);
                } else {
                    out.push_str(&rendered);
                    out.push_str(".0");
                }
            } else {
                // Non-finite doubles are written as null per spec.
                out.push_str("null");
            }
        }
        Value::Str(s) => {
            out.push('"');
            json_escape_into(s, out);
            out.push('"');
        }
        Value::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                json_encode_into(item, out);
            }
            out.push(']');
        }
        Value::Map(map) => {
            out.push('{');
            for (i, (k, v)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('"');
                json_escape_into(&quark::get(k), out);
                out.push_str("\":");
                json_encode_into(v, out);
            }
            out.push('}');
        }
    }
}

fn json_escape_into(bytes: &[u8], out: &mut String) {
    // Valid JSON string input is UTF-8; lossily convert rather than fail
    // hard on stray non-UTF-8 bytes that can show up in peer-reported
    // torrent names.
    let s = String::from_utf8_lossy(bytes);
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
}

pub fn json_decode(text: &str) -> Result<Value, JsonError> {
    let bytes = text.as_bytes();
    let mut pos = 0;
    skip_ws(bytes, &mut pos);
    let value = json_decode_value(bytes, &mut pos)?;
    skip_ws(bytes, &mut pos);
    Ok(value)
}

fn skip_ws(bytes: &[u8], pos: &mut usize) {
    while matches!(bytes.get(*pos), Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')) {
        *pos += 1;
    }
}

fn json_decode_value(bytes: &[u8], pos: &mut usize) -> Result<Value, JsonError> {
    skip_ws(bytes, pos);
    match bytes.get(*pos) {
        None => Err(JsonError::Eof),
        Some(b'"') => json_decode_string(bytes, pos).map(Value::Str),
        Some(b'{') => json_decode_map(bytes, pos),
        Some(b'[') => json_decode_list(bytes, pos),
        Some(b't') => json_decode_literal(bytes, pos, "true", Value::Bool(true)),
        Some(b'f') => json_decode_literal(bytes, pos, "false", Value::Bool(false)),
        Some(b'n') => json_decode_literal(bytes, pos, "null", Value::Null),
        Some(c) if *c == b'-' || c.is_ascii_digit() => json_decode_number(bytes, pos),
        Some(_) => Err(JsonError::Syntax(*pos)),
    }
}

fn json_decode_literal(
    bytes: &[u8],
    pos: &mut usize,
    lit: &str,
    value: Value,
) -> Result<Value, JsonError> {
    let lit_bytes = lit.as_bytes();
    if bytes.len() < *pos + lit_bytes.len() || &bytes[*pos..*pos + lit_bytes.len()] != lit_bytes {
        return Err(JsonError::Syntax(*pos));
    }
    *pos += lit_bytes.len();
    Ok(value)
}

fn json_decode_number(bytes: &[u8], pos: &mut usize) -> Result<Value, JsonError> {
    let start = *pos;
    if bytes.get(*pos) == Some(&b'-') {
        *pos += 1;
    }
    let mut is_double = false;
    while let Some(c) = bytes.get(*pos) {
        match c {
            b'0'..=b'9' => *pos += 1,
            b'.' | b'e' | b'E' | b'+' | b'-' => {
                is_double = true;
                *pos += 1;
            }
            _ => break,
        }
    }
    let s = std::str::from_utf8(&bytes[start..*pos]).map_err(|_| JsonError::Syntax(start))?;
    if is_double {
        s.parse::<f64>()
            .map(Value::Double)
            .map_err(|_| JsonError::Syntax(start))
    } else {
        s.parse::<i64>()
            .map(Value::Int)
            .map_err(|_| JsonError::Syntax(start))
    }
}

fn json_decode_string(bytes: &[u8], pos: &mut usize) -> Result<Vec<u8>, JsonError> {
    if bytes.get(*pos) != Some(&b'"') {
        return Err(JsonError::Syntax(*pos));
    }
    *pos += 1;
    let mut s = String::new();
    loop {
        match bytes.get(*pos) {
            None => return Err(JsonError::Eof),
            Some(b'"') => {
                *pos += 1;
                break;
            }
            Some(b'\\') => {
                *pos += 1;
                match bytes.get(*pos) {
                    Some(b'"') => s.push('"'),
                    Some(b'\\') => s.push('\\'),
                    Some(b'/') => s.push('/'),
                    Some(b'n') => s.push('\n'),
                    Some(b't') => s.push('\t'),
                    Some(b'r') => s.push('\r'),
                    Some(b'b') => s.push('\u{0008}'),
                    Some(b'f') => s.push('\u{000C}'),
                    Some(b'u') => {
                        let hex = bytes
                            .get(*pos + 1..*pos + 5)
                            .ok_or(JsonError::Eof)?;
                        let code = u32::from_str_radix(
                            std::str::from_utf8(hex).map_err(|_| JsonError::InvalidUtf8)?,
                            16,
                        )
                        .map_err(|_| JsonError::Syntax(*pos))?;
                        s.push(char::from_u32(code).ok_or(JsonError::Syntax(*pos))?);
                        *pos += 4;
                    }
                    _ => return Err(JsonError::Syntax(*pos)),
                }
                *pos += 1;
            }
            Some(_) => {
                // Consume one UTF-8 scalar value at a time so multi-byte
                // characters in torrent names survive the copy.
                let rest = &bytes[*pos..];
                let ch_len = utf8_char_len(rest[0]);
                let chunk = rest.get(..ch_len).ok_or(JsonError::InvalidUtf8)?;
                s.push_str(std::str::from_utf8(chunk).map_err(|_| JsonError::InvalidUtf8)?);
                *pos += ch_len;
            }
        }
    }
    Ok(s.into_bytes())
}

fn utf8_char_len(first_byte: u8) -> usize {
    if first_byte & 0x80 == 0 {
        1
    } else if first_byte & 0xE0 == 0xC0 {
        2
    } else if first_byte & 0xF0 == 0xE0 {
        3
    } else {
        4
    }
}

fn json_decode_list(bytes: &[u8], pos: &mut usize) -> Result<Value, JsonError> {
    *pos += 1; // '['
    let mut items = Vec::new();
    skip_ws(bytes, pos);
    if bytes.get(*pos) == Some(&b']') {
        *pos += 1;
        return Ok(Value::List(items));
    }
    loop {
        items.push(json_decode_value(bytes, pos)?);
        skip_ws(bytes, pos);
        match bytes.get(*pos) {
            Some(b',') => {
                *pos += 1;
            }
            Some(b']') => {
                *pos += 1;
                break;
            }
            _ => return Err(JsonError::Syntax(*pos)),
        }
    }
    Ok(Value::List(items))
}

fn json_decode_map(bytes: &[u8], pos: &mut usize) -> Result<Value, JsonError> {
    *pos += 1; // '{'
    let mut map = ValueMap::new();
    skip_ws(bytes, pos);
    if bytes.get(*pos) == Some(&b'}') {
        *pos += 1;
        return Ok(Value::Map(map));
    }
    loop {
        skip_ws(bytes, pos);
        let key = json_decode_string(bytes, pos)?;
        skip_ws(bytes, pos);
        if bytes.get(*pos) != Some(&b':') {
            return Err(JsonError::Syntax(*pos));
        }
        *pos += 1;
        let value = json_decode_value(bytes, pos)?;
        map.insert(quark::intern(&key), value);
        skip_ws(bytes, pos);
        match bytes.get(*pos) {
            Some(b',') => {
                *pos += 1;
            }
            Some(b'}') => {
                *pos += 1;
                break;
            }
            _ => return Err(JsonError::Syntax(*pos)),
        }
    }
    Ok(Value::Map(map))
}

// BTreeMap re-export used by the bencode metainfo->resume bridge in
// storage::resume, kept here so both codecs share one sorted-map type.
pub type SortedStrMap = BTreeMap<Vec<u8>, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_value() -> Value {
        let mut inner = ValueMap::new();
        inner.insert_str("a", Value::Int(1));
        inner.insert_str("b", Value::string("two"));
        inner.insert_str("c", Value::Double(4.0));
        let mut outer = ValueMap::new();
        outer.insert_str(
            "list",
            Value::List(vec![Value::Int(1), Value::Bool(true), Value::Null, Value::Double(1.5)]),
        );
        outer.insert_str("map", Value::Map(inner));
        Value::Map(outer)
    }

    #[test]
    fn bencode_round_trips() {
        let v = sample_value();
        let encoded = bencode_encode(&v);
        let decoded = bencode_decode(&encoded).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn bencode_round_trips_double_exactly() {
        for d in [0.0, -0.0, 1.5, -3.25, f64::MIN_POSITIVE, 1e300] {
            let encoded = bencode_encode(&Value::Double(d));
            let decoded = bencode_decode(&encoded).unwrap();
            assert_eq!(decoded.as_f64().unwrap().to_bits(), d.to_bits());
        }
    }

    #[test]
    fn bencode_round_trips_non_finite_double_bit_exact() {
        for d in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let encoded = bencode_encode(&Value::Double(d));
            let decoded = bencode_decode(&encoded).unwrap();
            match decoded {
                Value::Double(got) => assert_eq!(got.to_bits(), d.to_bits()),
                other => panic!("expected Double, got {other:?}"),
            }
        }
    }

    #[test]
    fn bencode_round_trips_null_and_bool() {
        assert_eq!(bencode_decode(&bencode_encode(&Value::Null)).unwrap(), Value::Null);
        assert_eq!(bencode_decode(&bencode_encode(&Value::Bool(true))).unwrap(), Value::Bool(true));
        assert_eq!(bencode_decode(&bencode_encode(&Value::Bool(false))).unwrap(), Value::Bool(false));
    }

    #[test]
    fn bencode_dict_keys_are_byte_lex_ordered() {
        let mut map = ValueMap::new();
        map.insert_str("zebra", Value::Int(1));
        map.insert_str("apple", Value::Int(2));
        map.insert_str("mango", Value::Int(3));
        let encoded = bencode_encode(&Value::Map(map));
        let s = String::from_utf8_lossy(&encoded);
        let apple_pos = s.find("apple").unwrap();
        let mango_pos = s.find("mango").unwrap();
        let zebra_pos = s.find("zebra").unwrap();
        assert!(apple_pos < mango_pos && mango_pos < zebra_pos);
    }

    #[test]
    fn json_round_trips() {
        let v = sample_value();
        let encoded = json_encode(&v);
        let decoded = json_decode(&encoded).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn json_encodes_non_finite_doubles_as_null() {
        assert_eq!(json_encode(&Value::Double(f64::NAN)), "null");
        assert_eq!(json_encode(&Value::Double(f64::INFINITY)), "null");
    }

    #[test]
    fn json_decode_handles_escapes() {
        let v = json_decode(r#""a\n\"b\"A""#).unwrap();
        assert_eq!(v, Value::Str(b"a\n\"b\"A".to_vec()));
    }
}
