//! wasm接口

pub mod quad_bitmask;
