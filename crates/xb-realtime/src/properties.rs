//! Module properties
//!
//! Typed key/value configuration handed to a processing module at init.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use xb_core::{XbError, XbResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
}

/// Property set of one module
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    values: BTreeMap<String, PropertyValue>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: PropertyValue) -> &mut Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Float lookup. Integers are widened.
    pub fn get_float(&self, key: &str) -> XbResult<f64> {
        match self.get(key) {
            Some(PropertyValue::Float(v)) => Ok(*v),
            Some(PropertyValue::Int(v)) => Ok(*v as f64),
            Some(other) => Err(wrong_type(key, "float", other)),
            None => Err(missing(key)),
        }
    }

    pub fn get_float_list(&self, key: &str) -> XbResult<&[f64]> {
        match self.get(key) {
            Some(PropertyValue::FloatList(v)) => Ok(v),
            Some(other) => Err(wrong_type(key, "float list", other)),
            None => Err(missing(key)),
        }
    }

    pub fn get_float_or(&self, key: &str, default: f64) -> XbResult<f64> {
        if self.contains(key) {
            self.get_float(key)
        } else {
            Ok(default)
        }
    }
}

fn missing(key: &str) -> XbError {
    XbError::InvalidParam(format!("property '{}' is not set", key))
}

fn wrong_type(key: &str, expected: &str, found: &PropertyValue) -> XbError {
    XbError::InvalidParam(format!(
        "property '{}' is not a {} (found {:?})",
        key, expected, found
    ))
}
