//! 稀疏位图叉树
//！N维整数坐标上的布尔场，每个内部节点有2^D个子节点，子节点序号的第d位表示在第d维上为小(0)或大(1)。
//！叶子是固定大小的位图，全相同的区域收缩成单值节点，写入区间外的true时树向外长高。
//！读取不加锁，写入由可增长树内部的锁串行。

pub mod algorithms;
pub mod bitmask;
pub mod bounds;
pub mod error;
pub mod growable;
pub mod node;
pub mod oct_helper;
pub mod quad_helper;
pub mod sparse;
pub mod tree;
#[cfg(target_arch = "wasm32")]
pub mod web;

pub use bitmask::*;
pub use bounds::*;
pub use error::*;
pub use growable::*;
pub use node::*;
pub use oct_helper::{OctBitmask, OctTree};
pub use quad_helper::{QuadBitmask, QuadTree};
pub use sparse::*;
pub use tree::*;
