//! Compact JSON rendering of value trees.

use std::fmt::Write;

use crate::value::{ValueRef, ValueType};

pub(crate) fn to_json(v: ValueRef<'_>) -> String {
    let mut out = String::new();
    write_value(&mut out, v);
    out
}

fn write_value(out: &mut String, v: ValueRef<'_>) {
    match v.value_type() {
        ValueType::Null | ValueType::Undefined => out.push_str("null"),
        ValueType::Bool => out.push_str(if v.as_bool() { "true" } else { "false" }),
        ValueType::Number => {
            if v.is_integer() {
                if v.is_unsigned() {
                    let _ = write!(out, "{}", v.as_unsigned());
                } else {
                    let _ = write!(out, "{}", v.as_int());
                }
            } else {
                write_double(out, v.as_double());
            }
        }
        ValueType::String => write_string(out, v.as_str().unwrap_or_default()),
        ValueType::Data => {
            out.push('"');
            write_base64(out, v.as_data().unwrap_or_default());
            out.push('"');
        }
        ValueType::Array => {
            out.push('[');
            let mut first = true;
            for e in v.as_array().expect("array-tagged").iter() {
                if !first {
                    out.push(',');
                }
                first = false;
                write_value(out, e);
            }
            out.push(']');
        }
        ValueType::Dict => {
            out.push('{');
            let mut first = true;
            for (k, e) in v.as_dict().expect("dict-tagged").iter() {
                if !first {
                    out.push(',');
                }
                first = false;
                write_string(out, k);
                out.push(':');
                write_value(out, e);
            }
            out.push('}');
        }
    }
}

fn write_double(out: &mut String, d: f64) {
    if !d.is_finite() {
        out.push_str("null");
    } else if d == d.trunc() && d.abs() < 1e15 {
        let _ = write!(out, "{d:.1}");
    } else {
        let _ = write!(out, "{d}");
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

const BASE64: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn write_base64(out: &mut String, data: &[u8]) {
    for chunk in data.chunks(3) {
        let b = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
        let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
        out.push(BASE64[(n >> 18) as usize & 63] as char);
        out.push(BASE64[(n >> 12) as usize & 63] as char);
        out.push(if chunk.len() > 1 {
            BASE64[(n >> 6) as usize & 63] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            BASE64[n as usize & 63] as char
        } else {
            '='
        });
    }
}
