//! Core data types for VDC

use serde::{Deserialize, Serialize};
use std::fmt;

/// External storage types supported by VDC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum XType {
    /// 32-bit floating point
    Float = 0,
    /// 64-bit floating point
    Double = 1,
    /// Signed 32-bit integer
    Int32 = 2,
    /// Signed 64-bit integer
    Int64 = 3,
    /// Character text
    Text = 4,
}

impl XType {
    /// Size in bytes of one element
    pub fn size_in_bytes(&self) -> usize {
        match self {
            XType::Text => 1,
            XType::Float | XType::Int32 => 4,
            XType::Double | XType::Int64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, XType::Float | XType::Double)
    }

    /// Check if this is an integer type
    pub fn is_integer(&self) -> bool {
        matches!(self, XType::Int32 | XType::Int64)
    }

    /// Persistent name used in master metadata
    pub fn name(&self) -> &'static str {
        match self {
            XType::Float => "FLOAT",
            XType::Double => "DOUBLE",
            XType::Int32 => "INT32",
            XType::Int64 => "INT64",
            XType::Text => "TEXT",
        }
    }

    /// Parse a persistent type name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "FLOAT" => Some(XType::Float),
            "DOUBLE" => Some(XType::Double),
            "INT32" => Some(XType::Int32),
            "INT64" => Some(XType::Int64),
            "TEXT" => Some(XType::Text),
            _ => None,
        }
    }
}

impl fmt::Display for XType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Coordinate axis a dimension varies along
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Axis {
    /// X or longitude
    X = 0,
    /// Y or latitude
    Y = 1,
    /// Z or vertical
    Z = 2,
    /// Time
    T = 3,
}

impl Axis {
    /// Convert from integer index
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Axis::X),
            1 => Some(Axis::Y),
            2 => Some(Axis::Z),
            3 => Some(Axis::T),
            _ => None,
        }
    }

    /// Convert to integer index
    pub fn to_index(&self) -> usize {
        *self as usize
    }

    pub fn is_time(&self) -> bool {
        *self == Axis::T
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How a collection is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Read an existing collection
    Read,
    /// Create a new collection, replacing any existing one
    Write,
    /// Add variables and data to an existing collection
    Append,
}

impl AccessMode {
    pub fn is_writable(&self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}
