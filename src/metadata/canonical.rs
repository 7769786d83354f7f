//
// Copyright 2023 The Playground Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Canonical JSON encoding of signed payloads.
//!
//! Signature payloads must be byte-stable across load/save round-trips and
//! across implementations: object keys are sorted, no insignificant
//! whitespace is emitted, and only integer numbers are representable.

use std::collections::BTreeMap;

use crate::errors::{PlaygroundError, Result};

/// Serialize `data` into canonical JSON bytes.
pub fn to_canonical_json<T: serde::Serialize>(data: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(data)?;
    canonicalize(&value)
}

/// Canonicalize an already-parsed JSON value.
pub fn canonicalize(value: &serde_json::Value) -> Result<Vec<u8>> {
    let converted = convert(value)?;
    let mut buf = Vec::new();
    converted.write(&mut buf);
    Ok(buf)
}

enum Value {
    Array(Vec<Value>),
    Bool(bool),
    Null,
    Number(Number),
    Object(BTreeMap<String, Value>),
    String(String),
}

enum Number {
    I64(i64),
    U64(u64),
}

impl Value {
    fn write(&self, buf: &mut Vec<u8>) {
        match *self {
            Value::Null => buf.extend(b"null"),
            Value::Bool(true) => buf.extend(b"true"),
            Value::Bool(false) => buf.extend(b"false"),
            Value::Number(Number::I64(n)) => {
                let mut itoa_buf = itoa::Buffer::new();
                buf.extend(itoa_buf.format(n).as_bytes());
            }
            Value::Number(Number::U64(n)) => {
                let mut itoa_buf = itoa::Buffer::new();
                buf.extend(itoa_buf.format(n).as_bytes());
            }
            Value::String(ref s) => write_escaped(s, buf),
            Value::Array(ref arr) => {
                buf.push(b'[');
                let mut first = true;
                for a in arr.iter() {
                    if !first {
                        buf.push(b',');
                    }
                    a.write(buf);
                    first = false;
                }
                buf.push(b']');
            }
            Value::Object(ref obj) => {
                buf.push(b'{');
                let mut first = true;
                for (k, v) in obj.iter() {
                    if !first {
                        buf.push(b',');
                    }
                    first = false;
                    write_escaped(k, buf);
                    buf.push(b':');
                    v.write(buf);
                }
                buf.push(b'}');
            }
        }
    }
}

// serde_json already implements JSON string escaping; reuse it rather than
// maintaining a second escape table.
fn write_escaped(s: &str, buf: &mut Vec<u8>) {
    let escaped = serde_json::Value::String(s.to_string()).to_string();
    buf.extend(escaped.as_bytes());
}

fn convert(value: &serde_json::Value) -> Result<Value> {
    match *value {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
        serde_json::Value::Number(ref n) => n
            .as_i64()
            .map(Number::I64)
            .or_else(|| n.as_u64().map(Number::U64))
            .map(Value::Number)
            .ok_or_else(|| {
                PlaygroundError::MalformedMetadata(
                    "canonical JSON supports only integer numbers".to_string(),
                )
            }),
        serde_json::Value::Array(ref arr) => {
            let mut out = Vec::new();
            for member in arr {
                out.push(convert(member)?);
            }
            Ok(Value::Array(out))
        }
        serde_json::Value::Object(ref obj) => {
            let mut out = BTreeMap::new();
            for (k, v) in obj.iter() {
                out.insert(k.clone(), convert(v)?);
            }
            Ok(Value::Object(out))
        }
        serde_json::Value::String(ref s) => Ok(Value::String(s.clone())),
    }
}
