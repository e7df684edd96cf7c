//! 错误类型

use thiserror::Error;

/// 稀疏位图的错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BitmaskError {
    #[error("dimension count {0} is out of range 1..=16")]
    InvalidDimensions(usize),
    #[error("leaf extent {extent} of dimension {dim} is not a power of two")]
    NotPowerOfTwo { dim: usize, extent: usize },
    #[error("leaf extent {0} of dimension 0 must be at least 8")]
    FirstExtentTooSmall(usize),
    #[error("leaf bit count exceeds the addressable range")]
    CapacityOverflow,
    #[error("expected {expected} coordinates, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("dimension index {dim} is out of range for {dimensions} dimensions")]
    DimensionOutOfRange { dim: usize, dimensions: usize },
    #[error("tree height {height} exceeds the coordinate range (max {max})")]
    HeightOverflow { height: usize, max: usize },
    #[error("coordinate lies outside the representable range")]
    CoordinateOverflow,
    /// 视图创建后位图又被修改过，需要重新获取视图
    #[error("view is stale: captured at modification {captured}, now at {current}")]
    Stale { captured: u64, current: u64 },
}

pub type Result<T> = std::result::Result<T, BitmaskError>;
