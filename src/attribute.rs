//! Typed attributes with numeric and text coercion

use crate::types::XType;
use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};

/// Attribute value list, tagged by its external storage type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValues {
    Float(Vec<f32>),
    Double(Vec<f64>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Text(String),
}

fn cast_all<T, U>(values: &[T]) -> Vec<U>
where
    T: AsPrimitive<U>,
    U: Copy + 'static,
{
    values.iter().map(|v| v.as_()).collect()
}

fn chars_from<T: AsPrimitive<u8>>(values: &[T]) -> String {
    values.iter().map(|v| v.as_() as char).collect()
}

impl AttrValues {
    /// External type of the stored values
    pub fn xtype(&self) -> XType {
        match self {
            AttrValues::Float(_) => XType::Float,
            AttrValues::Double(_) => XType::Double,
            AttrValues::Int32(_) => XType::Int32,
            AttrValues::Int64(_) => XType::Int64,
            AttrValues::Text(_) => XType::Text,
        }
    }

    /// Number of stored values (characters for text)
    pub fn len(&self) -> usize {
        match self {
            AttrValues::Float(v) => v.len(),
            AttrValues::Double(v) => v.len(),
            AttrValues::Int32(v) => v.len(),
            AttrValues::Int64(v) => v.len(),
            AttrValues::Text(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values as doubles. Text yields character codes.
    pub fn as_f64(&self) -> Vec<f64> {
        match self {
            AttrValues::Float(v) => cast_all(v),
            AttrValues::Double(v) => v.clone(),
            AttrValues::Int32(v) => cast_all(v),
            AttrValues::Int64(v) => cast_all(v),
            AttrValues::Text(s) => s.bytes().map(f64::from).collect(),
        }
    }

    /// Values as 64-bit integers. Floating values are truncated.
    pub fn as_i64(&self) -> Vec<i64> {
        match self {
            AttrValues::Float(v) => cast_all(v),
            AttrValues::Double(v) => cast_all(v),
            AttrValues::Int32(v) => cast_all(v),
            AttrValues::Int64(v) => v.clone(),
            AttrValues::Text(s) => s.bytes().map(i64::from).collect(),
        }
    }

    /// Values as text. Numeric values become one character each.
    pub fn as_text(&self) -> String {
        match self {
            AttrValues::Float(v) => chars_from(v),
            AttrValues::Double(v) => chars_from(v),
            AttrValues::Int32(v) => chars_from(v),
            AttrValues::Int64(v) => chars_from(v),
            AttrValues::Text(s) => s.clone(),
        }
    }

    /// Coerce into storage of a different external type
    pub fn convert(&self, xtype: XType) -> AttrValues {
        if self.xtype() == xtype {
            return self.clone();
        }
        match xtype {
            XType::Float => AttrValues::Float(cast_all(&self.as_f64())),
            XType::Double => AttrValues::Double(self.as_f64()),
            XType::Int32 => AttrValues::Int32(match self {
                AttrValues::Float(_) | AttrValues::Double(_) => cast_all(&self.as_f64()),
                _ => cast_all(&self.as_i64()),
            }),
            XType::Int64 => AttrValues::Int64(self.as_i64()),
            XType::Text => AttrValues::Text(self.as_text()),
        }
    }
}

impl From<Vec<f32>> for AttrValues {
    fn from(v: Vec<f32>) -> Self {
        AttrValues::Float(v)
    }
}

impl From<Vec<f64>> for AttrValues {
    fn from(v: Vec<f64>) -> Self {
        AttrValues::Double(v)
    }
}

impl From<Vec<i32>> for AttrValues {
    fn from(v: Vec<i32>) -> Self {
        AttrValues::Int32(v)
    }
}

impl From<Vec<i64>> for AttrValues {
    fn from(v: Vec<i64>) -> Self {
        AttrValues::Int64(v)
    }
}

impl From<&str> for AttrValues {
    fn from(s: &str) -> Self {
        AttrValues::Text(s.to_string())
    }
}

impl From<String> for AttrValues {
    fn from(s: String) -> Self {
        AttrValues::Text(s)
    }
}

/// A named, typed attribute bound to a variable or to the collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    name: String,
    values: AttrValues,
}

impl Attribute {
    /// Create an attribute stored as `xtype`, coercing `values` as needed
    pub fn new(name: impl Into<String>, xtype: XType, values: impl Into<AttrValues>) -> Self {
        Self {
            name: name.into(),
            values: values.into().convert(xtype),
        }
    }

    /// Create an attribute stored in the values' own type
    pub fn from_values(name: impl Into<String>, values: impl Into<AttrValues>) -> Self {
        Self {
            name: name.into(),
            values: values.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn xtype(&self) -> XType {
        self.values.xtype()
    }

    pub fn values(&self) -> &AttrValues {
        &self.values
    }

    pub fn as_f64(&self) -> Vec<f64> {
        self.values.as_f64()
    }

    pub fn as_i64(&self) -> Vec<i64> {
        self.values.as_i64()
    }

    pub fn as_text(&self) -> String {
        self.values.as_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_coercion_truncates() {
        let att = Attribute::new("scale", XType::Int32, vec![1.9f64, -2.7, 3.0]);
        assert_eq!(att.xtype(), XType::Int32);
        assert_eq!(att.as_i64(), vec![1, -2, 3]);
        assert_eq!(att.as_f64(), vec![1.0, -2.0, 3.0]);
    }

    #[test]
    fn test_float_storage_rounds_through_f32() {
        let att = Attribute::new("v", XType::Float, vec![0.1f64]);
        assert_eq!(att.as_f64(), vec![0.1f32 as f64]);
    }

    #[test]
    fn test_text_numeric_round_trip() {
        let att = Attribute::new("units", XType::Int64, "m/s");
        assert_eq!(att.as_i64(), vec![109, 47, 115]);
        assert_eq!(att.as_text(), "m/s");

        let back = Attribute::new("units", XType::Text, att.as_i64());
        assert_eq!(back.as_text(), "m/s");
    }

    #[test]
    fn test_from_values_keeps_type() {
        let att = Attribute::from_values("ids", vec![4i64, 5]);
        assert_eq!(att.xtype(), XType::Int64);
        assert_eq!(att.values().len(), 2);
    }
}
