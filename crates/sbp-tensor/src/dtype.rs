use std::fmt;
use std::str::FromStr;

use crate::error::TensorError;

/// Element types a logical tensor can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    Int8,
    UInt8,
    Int32,
    Int64,
    /// IEEE 754 half precision (`half::f16`).
    Float16,
    /// Brain floating point (`half::bf16`).
    BFloat16,
    Float32,
    Float64,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::Bool | DType::Int8 | DType::UInt8 => 1,
            DType::Float16 => std::mem::size_of::<half::f16>(),
            DType::BFloat16 => std::mem::size_of::<half::bf16>(),
            DType::Int32 | DType::Float32 => 4,
            DType::Int64 | DType::Float64 => 8,
        }
    }

    /// Returns true for floating point types.
    pub fn is_floating(&self) -> bool {
        matches!(
            self,
            DType::Float16 | DType::BFloat16 | DType::Float32 | DType::Float64
        )
    }

    /// Canonical lower-case name, as accepted by `FromStr`.
    pub fn name(&self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int8 => "int8",
            DType::UInt8 => "uint8",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float16 => "float16",
            DType::BFloat16 => "bfloat16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bool" => Ok(DType::Bool),
            "int8" => Ok(DType::Int8),
            "uint8" => Ok(DType::UInt8),
            "int32" => Ok(DType::Int32),
            "int64" => Ok(DType::Int64),
            "float16" | "half" => Ok(DType::Float16),
            "bfloat16" => Ok(DType::BFloat16),
            "float32" | "float" => Ok(DType::Float32),
            "float64" | "double" => Ok(DType::Float64),
            other => Err(TensorError::UnknownDType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_in_bytes() {
        assert_eq!(DType::Float32.size_in_bytes(), 4);
        assert_eq!(DType::Float16.size_in_bytes(), 2);
        assert_eq!(DType::BFloat16.size_in_bytes(), 2);
        assert_eq!(DType::Int64.size_in_bytes(), 8);
        assert_eq!(DType::Bool.size_in_bytes(), 1);
    }

    #[test]
    fn test_parse_names() {
        for dtype in [DType::Int32, DType::Float16, DType::Float64, DType::Bool] {
            assert_eq!(dtype.name().parse::<DType>().unwrap(), dtype);
        }
        assert_eq!("double".parse::<DType>().unwrap(), DType::Float64);
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(
            "complex64".parse::<DType>().unwrap_err(),
            TensorError::UnknownDType("complex64".to_string())
        );
    }

    #[test]
    fn test_is_floating() {
        assert!(DType::BFloat16.is_floating());
        assert!(!DType::Int8.is_floating());
    }
}
