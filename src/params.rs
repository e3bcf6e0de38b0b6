// src/params.rs
//! Opaque parameter values flowing through the pipeline.
//!
//! The pipeline never interprets these — they are cache inputs and payload for
//! the parameter-binding collaborator. The only behavior the pipeline relies on
//! is the canonical digest encoding: identical values produce identical bytes
//! no matter how they were constructed or formatted upstream.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single customizer parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<ParamValue>),
}

// Digest tags. Stable; changing one invalidates every cached mesh.
const TAG_BOOL: u8 = 0x01;
const TAG_NUMBER: u8 = 0x02;
const TAG_TEXT: u8 = 0x03;
const TAG_LIST: u8 = 0x04;

impl ParamValue {
    pub fn new_bool(value: bool) -> Self {
        ParamValue::Bool(value)
    }

    pub fn new_number(value: f64) -> Self {
        ParamValue::Number(value)
    }

    pub fn new_text<S: Into<String>>(value: S) -> Self {
        ParamValue::Text(value.into())
    }

    pub fn new_list(values: Vec<ParamValue>) -> Self {
        ParamValue::List(values)
    }

    /// Feed the canonical encoding of this value into a digest.
    ///
    /// Numbers hash their bit pattern (`f64::to_bits`), so the encoding is
    /// insensitive to how the value was formatted as text upstream.
    /// Variable-length fields are length-prefixed to keep the encoding
    /// unambiguous under concatenation.
    pub(crate) fn digest_into(&self, hasher: &mut Sha256) {
        match self {
            ParamValue::Bool(b) => {
                hasher.update([TAG_BOOL, *b as u8]);
            }
            ParamValue::Number(n) => {
                hasher.update([TAG_NUMBER]);
                hasher.update(n.to_bits().to_le_bytes());
            }
            ParamValue::Text(s) => {
                hasher.update([TAG_TEXT]);
                hasher.update((s.len() as u64).to_le_bytes());
                hasher.update(s.as_bytes());
            }
            ParamValue::List(items) => {
                hasher.update([TAG_LIST]);
                hasher.update((items.len() as u64).to_le_bytes());
                for item in items {
                    item.digest_into(hasher);
                }
            }
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Number(v as f64)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Number(n) => write!(f, "{}", n),
            ParamValue::Text(s) => write!(f, "{}", s),
            ParamValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}
