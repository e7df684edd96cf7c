//! 稀疏位图N叉树
//! 高度为H的树覆盖 [0, leafExtent[d] * 2^H - 1] 的区间，根节点在第H层，叶子在第0层。
//! 每层用坐标的一位来选择子节点，子节点的序号第d位对应第d维。
//! 节点按需创建：写入和所在单值节点不同的值时才分裂；叶子位图变成全同时收缩，并向上合并。
//!
//! 写入方只能有一个，由调用方保证串行；读取不加锁，可以和写入同时进行。

use std::mem;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::{debug, trace};
use nalgebra::Point;

use crate::algorithms;
use crate::bitmask::{LeafBitmask, Specification};
use crate::bounds::{Bounds, Coord};
use crate::error::{BitmaskError, Result};
use crate::node::{Node, NodeData, NodeIter, Positions};

// 写入时记录的下降路径，(父节点, 子节点序号)，用于向上合并
type Path<const D: usize> = Vec<(Arc<NodeData<D>>, usize)>;

// 下降的下一步
enum Step<const D: usize> {
    // 当前节点被替换，在同一层继续
    Stay(Arc<NodeData<D>>),
    // 进入子节点
    Down(usize, Arc<NodeData<D>>),
}

/// 坐标类型S下，该叶子形状允许的最大高度
pub fn max_height<S: Coord, const D: usize>(spec: &Specification<D>) -> Option<usize> {
    (S::BITS - 2).checked_sub(spec.max_shift())
}

///
/// 固定范围的稀疏位图树
///
pub struct Tree<S: Coord, const D: usize> {
    spec: Arc<Specification<D>>,
    extent: [S; D],
    height: usize,
    root: ArcSwap<NodeData<D>>,
    bounds: Bounds<S, D>,
    uniform: [Arc<NodeData<D>>; 2], // 共享的单值节点，false和true
}

impl<S: Coord, const D: usize> Tree<S, D> {
    /// 构建树，需传入各维度的叶子大小及树的高度
    pub fn new(extent: [usize; D], height: usize) -> Result<Self> {
        Self::with_specification(Arc::new(Specification::new(extent)?), height)
    }

    /// 用共享的叶子形状构建全false的树
    pub fn with_specification(spec: Arc<Specification<D>>, height: usize) -> Result<Self> {
        let tree = Self::from_root(spec, height, Arc::new(NodeData::Uniform(false)))?;
        debug!(
            "sparse bitmask tree created, extent: {:?}, height: {}",
            tree.spec.extent(),
            height
        );
        Ok(tree)
    }

    fn from_root(
        spec: Arc<Specification<D>>,
        height: usize,
        root: Arc<NodeData<D>>,
    ) -> Result<Self> {
        let max = max_height::<S, D>(&spec).ok_or(BitmaskError::CapacityOverflow)?;
        if height > max {
            return Err(BitmaskError::HeightOverflow { height, max });
        }
        let extent = (*spec.extent()).map(S::cast);
        let mut maxs = Point::from(extent);
        for d in 0..D {
            maxs[d] = (extent[d] << height) - S::one();
        }
        let origin = Point::from([S::zero(); D]);
        Ok(Tree {
            spec,
            extent,
            height,
            root: ArcSwap::new(root),
            bounds: Bounds::new(origin, maxs),
            uniform: [
                Arc::new(NodeData::Uniform(false)),
                Arc::new(NodeData::Uniform(true)),
            ],
        })
    }

    #[inline]
    pub fn specification(&self) -> &Arc<Specification<D>> {
        &self.spec
    }
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }
    /// 树覆盖的区间
    #[inline]
    pub fn bounds(&self) -> &Bounds<S, D> {
        &self.bounds
    }
    /// 当前的根节点
    #[inline]
    pub fn root(&self) -> Arc<NodeData<D>> {
        self.root.load_full()
    }

    #[inline]
    fn uniform(&self, value: bool) -> Arc<NodeData<D>> {
        self.uniform[value as usize].clone()
    }

    // level层的节点中，pos所在子节点的序号
    #[inline]
    fn child_index(&self, pos: &Point<S, D>, level: usize) -> usize {
        let shift = self.spec.shift();
        let mut i = 0;
        for d in 0..D {
            if (pos[d] >> (shift[d] + level - 1)) & S::one() == S::one() {
                i |= 1 << d;
            }
        }
        i
    }

    // pos在叶子内的位索引
    #[inline]
    fn leaf_index(&self, pos: &Point<S, D>) -> usize {
        let local: [usize; D] =
            std::array::from_fn(|d| (pos[d] & (self.extent[d] - S::one())).as_());
        self.spec.index(&local)
    }

    // 路径末端节点所在的槽位
    fn slot<'a>(&'a self, path: &'a [(Arc<NodeData<D>>, usize)]) -> &'a ArcSwap<NodeData<D>> {
        match path.last() {
            None => &self.root,
            Some((parent, i)) => match parent.children() {
                Some(children) => &children[*i],
                None => panic!("invalid state"),
            },
        }
    }

    /// 读取，pos必须在bounds内
    pub fn get(&self, pos: &Point<S, D>) -> bool {
        let mut node = self.root.load_full();
        let mut level = self.height;
        loop {
            let next = match &*node {
                NodeData::Uniform(v) => return *v,
                NodeData::Leaf(mask) => return mask.get(self.leaf_index(pos)),
                NodeData::Internal(children) => children[self.child_index(pos, level)].load_full(),
            };
            node = next;
            level -= 1;
        }
    }

    /// 写入，pos必须在bounds内，返回存储的值是否改变
    pub fn set(&self, pos: &Point<S, D>, value: bool) -> bool {
        let mut path: Path<D> = Vec::with_capacity(self.height);
        let mut node = self.root.load_full();
        let mut level = self.height;
        loop {
            let step = match &*node {
                NodeData::Uniform(v) if *v == value => return false,
                NodeData::Uniform(v) => {
                    if level == 0 {
                        // 叶子层，先用原值填满位图再写入
                        let mask = LeafBitmask::new(self.spec.clone(), *v);
                        mask.set(self.leaf_index(pos), value);
                        trace!("leaf materialized, fill: {}", v);
                        self.slot(&path).store(Arc::new(NodeData::Leaf(mask)));
                        return true;
                    }
                    let split = Arc::new(NodeData::split(&self.uniform(*v)));
                    self.slot(&path).store(split.clone());
                    Step::Stay(split)
                }
                NodeData::Leaf(mask) => {
                    let index = self.leaf_index(pos);
                    if mask.get(index) == value {
                        return false;
                    }
                    if mask.set(index, value) {
                        self.slot(&path).store(self.uniform(value));
                        self.merge_up(path, value);
                    }
                    return true;
                }
                NodeData::Internal(children) => {
                    let i = self.child_index(pos, level);
                    Step::Down(i, children[i].load_full())
                }
            };
            match step {
                Step::Stay(n) => node = n,
                Step::Down(i, child) => {
                    path.push((mem::replace(&mut node, child), i));
                    level -= 1;
                }
            }
        }
    }

    // 沿路径向上，子节点全部为value的父节点收缩为单值，遇到不满足的父节点即停止
    fn merge_up(&self, mut path: Path<D>, value: bool) {
        while let Some((parent, _)) = path.pop() {
            if parent.uniform_children() != Some(value) {
                break;
            }
            trace!("merge up, level: {}, value: {}", self.height - path.len(), value);
            self.slot(&path).store(self.uniform(value));
        }
    }

    /// 构建高一层的树，当前根节点放在新根的index子节点上，其余子节点为false
    pub fn grow(&self, index: usize) -> Result<Tree<S, D>> {
        let old = self.root.load_full();
        let old = match old.uniform_children() {
            Some(v) => self.uniform(v),
            None => old,
        };
        let root = if old.value() == Some(false) {
            old
        } else {
            Arc::new(NodeData::embed(old, index, &self.uniform(false)))
        };
        Tree::from_root(self.spec.clone(), self.height + 1, root)
    }

    /// 深度优先的节点迭代器
    pub fn nodes(&self) -> NodeIter<S, D> {
        NodeIter::new(
            self.spec.clone(),
            Node::new(self.root.load_full(), self.height, self.bounds),
        )
    }

    /// 所有节点都平移offset的节点迭代器
    pub fn nodes_translated(&self, offset: &Point<S, D>) -> NodeIter<S, D> {
        NodeIter::new(
            self.spec.clone(),
            Node::new(self.root.load_full(), self.height, self.bounds).translate(offset),
        )
    }

    /// 所有为true的位置
    pub fn positions(&self) -> Positions<S, D> {
        Positions::new(self.nodes())
    }

    /// 存储的节点数量
    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    /// 为true的位置数量
    pub fn size(&self) -> u64 {
        algorithms::size(self)
    }

    /// 所有为true的位置的包围盒，全false时返回None
    pub fn bbox(&self) -> Option<Bounds<S, D>> {
        algorithms::bbox(self)
    }
}

impl<S: Coord, const D: usize> std::fmt::Debug for Tree<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("extent", self.spec.extent())
            .field("height", &self.height)
            .field("bounds", &self.bounds)
            .finish()
    }
}

#[test]
fn test_single_leaf() {
    use crate::bounds::point;

    let tree = Tree::<i32, 2>::new([8, 8], 0).unwrap();
    assert_eq!(tree.bounds(), &Bounds::new(point([0, 0]), point([7, 7])));
    assert!(tree.set(&point([3, 3]), true));
    assert!(tree.get(&point([3, 3])));
    assert!(!tree.get(&point([0, 0])));
    assert_eq!(tree.size(), 1);
    assert!(!tree.set(&point([3, 3]), true));
}

#[test]
fn test_set_then_clear_restores_structure() {
    use crate::bounds::point;

    let tree = Tree::<i64, 3>::new([8, 4, 2], 4).unwrap();
    assert_eq!(tree.node_count(), 1);
    let p = point([77, 30, 17]);
    assert!(tree.set(&p, true));
    assert!(tree.get(&p));
    // 每层分裂出2^3个子节点
    assert_eq!(tree.node_count(), 1 + 4 * 8);
    assert!(tree.set(&p, false));
    assert!(!tree.get(&p));
    assert_eq!(tree.node_count(), 1);
    assert_eq!(tree.root().value(), Some(false));
}

#[test]
fn test_fill_leaf_collapses() {
    use crate::bounds::point;

    let tree = Tree::<i32, 2>::new([8, 8], 1).unwrap();
    for y in 8..16 {
        for x in 0..8 {
            tree.set(&point([x, y]), true);
        }
    }
    // 叶子填满后收缩成单值节点
    assert_eq!(tree.node_count(), 5);
    let root = tree.root();
    let children = root.children().unwrap();
    assert_eq!(children[2].load().value(), Some(true));
    assert_eq!(tree.size(), 64);

    for y in 0..8 {
        for x in 0..16 {
            tree.set(&point([x, y]), true);
        }
        for x in 8..16 {
            tree.set(&point([x, y + 8]), true);
        }
    }
    // 所有子节点都为true，根也合并
    assert_eq!(tree.node_count(), 1);
    assert_eq!(tree.root().value(), Some(true));
    assert_eq!(tree.size(), 256);

    tree.set(&point([15, 15]), false);
    assert_eq!(tree.size(), 255);
    assert!(!tree.get(&point([15, 15])));
    assert!(tree.get(&point([14, 15])));
}

#[test]
fn test_last_write_wins_random() {
    use std::collections::HashMap;

    use pcg_rand::Pcg32;
    use rand::{Rng, SeedableRng};

    use crate::bounds::point;

    let tree = Tree::<i32, 2>::new([16, 8], 3).unwrap();
    let mut model = HashMap::new();
    let mut rng = Pcg32::seed_from_u64(11);
    for _ in 0..5000 {
        let p = [rng.gen_range(0..128), rng.gen_range(0..64)];
        let v = rng.gen_bool(0.6);
        tree.set(&point(p), v);
        model.insert(p, v);
    }
    for y in 0..64 {
        for x in 0..128 {
            let expect = model.get(&[x, y]).copied().unwrap_or(false);
            assert_eq!(tree.get(&point([x, y])), expect);
        }
    }
    let count = model.values().filter(|v| **v).count() as u64;
    assert_eq!(tree.size(), count);
    assert_eq!(tree.positions().count() as u64, count);
}

#[test]
fn test_toggle_bounded_node_count() {
    use crate::bounds::point;

    let tree = Tree::<i32, 2>::new([8, 8], 3).unwrap();
    tree.set(&point([60, 1]), true);
    let base = tree.node_count();
    for _ in 0..20 {
        for y in 8..40 {
            for x in 16..48 {
                tree.set(&point([x, y]), true);
            }
        }
        assert_eq!(tree.size(), 32 * 32 + 1);
        for y in 8..40 {
            for x in 16..48 {
                tree.set(&point([x, y]), false);
            }
        }
        assert_eq!(tree.node_count(), base);
    }
}

#[test]
fn test_grow_embeds_root() {
    use crate::bounds::point;

    let tree = Tree::<i32, 2>::new([8, 8], 0).unwrap();
    tree.set(&point([1, 2]), true);
    let grown = tree.grow(3).unwrap();
    assert_eq!(grown.height(), 1);
    assert_eq!(grown.bounds().maxs, point([15, 15]));
    assert!(grown.get(&point([9, 10])));
    assert!(!grown.get(&point([1, 2])));
    assert_eq!(grown.size(), 1);

    // 全false的根直接保持单值
    let empty = Tree::<i32, 2>::new([8, 8], 2).unwrap().grow(1).unwrap();
    assert_eq!(empty.node_count(), 1);
}

#[test]
fn test_height_limit() {
    // i16: 16 - 2 - 3 = 11
    assert!(Tree::<i16, 2>::new([8, 8], 11).is_ok());
    assert_eq!(
        Tree::<i16, 2>::new([8, 8], 12).unwrap_err(),
        BitmaskError::HeightOverflow { height: 12, max: 11 }
    );
    let top = Tree::<i16, 2>::new([8, 8], 11).unwrap();
    assert!(top.grow(0).is_err());
}
