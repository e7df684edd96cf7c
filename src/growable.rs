//! 可增长的树
//! 树本身的区间是固定的，写入区间外的true时，构建高一层的树把原来的树放进去，
//! 并调整偏移量，再把 (树, 偏移量) 整体替换发布。读取方拿到的总是完整的一对。
//! 全局坐标 = 树内坐标 + 偏移量。

use std::sync::Arc;

use arc_swap::ArcSwap;
use log::debug;
use nalgebra::Point;
use num_traits::CheckedSub;
use parking_lot::Mutex;

use crate::bitmask::Specification;
use crate::bounds::{Bounds, Coord};
use crate::error::{BitmaskError, Result};
use crate::node::{NodeIter, Positions};
use crate::tree::Tree;

/// 发布出去的 (树, 偏移量)，不会被原地替换
#[derive(Debug)]
pub struct OffsetTree<S: Coord, const D: usize> {
    tree: Tree<S, D>,
    offset: Point<S, D>,
}

impl<S: Coord, const D: usize> OffsetTree<S, D> {
    pub fn new(tree: Tree<S, D>, offset: Point<S, D>) -> Self {
        OffsetTree { tree, offset }
    }
    #[inline]
    pub fn tree(&self) -> &Tree<S, D> {
        &self.tree
    }
    #[inline]
    pub fn offset(&self) -> &Point<S, D> {
        &self.offset
    }
    /// 全局坐标下的区间
    pub fn bounds(&self) -> Bounds<S, D> {
        self.tree.bounds().translate(&self.offset)
    }

    /// 全局坐标转为树内坐标，在区间外时返回None
    pub fn local(&self, pos: &Point<S, D>) -> Option<Point<S, D>> {
        let maxs = &self.tree.bounds().maxs;
        let mut local = *pos;
        for d in 0..D {
            // offset不大于0，offset + maxs不会溢出
            if pos[d] < self.offset[d] || pos[d] > self.offset[d] + maxs[d] {
                return None;
            }
            local[d] = pos[d] - self.offset[d];
        }
        Some(local)
    }

    pub fn get(&self, pos: &Point<S, D>) -> bool {
        match self.local(pos) {
            Some(local) => self.tree.get(&local),
            None => false,
        }
    }

    /// 向pos的方向长高一层。pos在某维度的下方时，原来的树放在该维度大的一半，偏移量减去原来的边长
    pub fn grow_towards(&self, pos: &Point<S, D>) -> Result<OffsetTree<S, D>> {
        let maxs = &self.tree.bounds().maxs;
        let mut index = 0;
        let mut offset = self.offset;
        for d in 0..D {
            if pos[d] < self.offset[d] {
                index |= 1 << d;
                let side = maxs[d] + S::one();
                offset[d] = CheckedSub::checked_sub(&offset[d], &side)
                    .ok_or(BitmaskError::CoordinateOverflow)?;
            }
        }
        let tree = self.tree.grow(index)?;
        debug!(
            "sparse bitmask grow, height: {}, child: {}, offset: {:?}",
            tree.height(),
            index,
            offset
        );
        Ok(OffsetTree { tree, offset })
    }

    /// 平移到全局坐标的节点迭代器
    pub fn nodes(&self) -> NodeIter<S, D> {
        self.tree.nodes_translated(&self.offset)
    }
    /// 全局坐标下所有为true的位置
    pub fn positions(&self) -> Positions<S, D> {
        Positions::new(self.nodes())
    }
    pub fn size(&self) -> u64 {
        self.tree.size()
    }
    /// 全局坐标下的包围盒
    pub fn bbox(&self) -> Option<Bounds<S, D>> {
        self.tree.bbox().map(|b| b.translate(&self.offset))
    }
}

///
/// 可增长的稀疏位图树
///
/// 写入由内部的锁串行，包括长高的过程；读取不加锁。
#[derive(Debug)]
pub struct GrowableTree<S: Coord, const D: usize> {
    current: ArcSwap<OffsetTree<S, D>>,
    writer: Mutex<()>,
}

impl<S: Coord, const D: usize> GrowableTree<S, D> {
    /// 构建，需传入各维度的叶子大小及初始高度
    pub fn new(extent: [usize; D], height: usize) -> Result<Self> {
        Self::with_specification(Arc::new(Specification::new(extent)?), height)
    }

    pub fn with_specification(spec: Arc<Specification<D>>, height: usize) -> Result<Self> {
        let tree = Tree::with_specification(spec, height)?;
        Ok(GrowableTree {
            current: ArcSwap::from_pointee(OffsetTree::new(tree, Point::from([S::zero(); D]))),
            writer: Mutex::new(()),
        })
    }

    /// 当前发布的 (树, 偏移量)
    #[inline]
    pub fn snapshot(&self) -> Arc<OffsetTree<S, D>> {
        self.current.load_full()
    }
    pub fn height(&self) -> usize {
        self.current.load().tree().height()
    }
    pub fn offset(&self) -> Point<S, D> {
        *self.current.load().offset()
    }
    /// 当前覆盖的区间
    pub fn bounds(&self) -> Bounds<S, D> {
        self.current.load().bounds()
    }

    /// 读取，区间外的位置为false
    pub fn get(&self, pos: &Point<S, D>) -> bool {
        self.current.load().get(pos)
    }

    /// 写入，返回存储的值是否改变
    ///
    /// 区间外写入false不做任何事；写入true时逐层长高，直到pos落入区间，
    /// 每次长高都完整发布后再继续。
    pub fn set(&self, pos: &Point<S, D>, value: bool) -> Result<bool> {
        let _guard = self.writer.lock();
        loop {
            let current = self.current.load_full();
            if let Some(local) = current.local(pos) {
                return Ok(current.tree().set(&local, value));
            }
            if !value {
                return Ok(false);
            }
            let grown = current.grow_towards(pos)?;
            self.current.store(Arc::new(grown));
        }
    }

    /// 清空，保留当前的高度和偏移量，返回清空前是否有为true的位置
    ///
    /// 全false的树根节点一定是Uniform(false)，不需要遍历。
    pub fn clear(&self) -> bool {
        let _guard = self.writer.lock();
        let current = self.current.load_full();
        if current.tree().root().value() == Some(false) {
            return false;
        }
        let spec = current.tree().specification().clone();
        let tree = match Tree::with_specification(spec, current.tree().height()) {
            Ok(tree) => tree,
            // 当前高度已通过校验
            Err(_) => panic!("invalid state"),
        };
        self.current
            .store(Arc::new(OffsetTree::new(tree, *current.offset())));
        true
    }

    pub fn nodes(&self) -> NodeIter<S, D> {
        self.current.load().nodes()
    }
    pub fn positions(&self) -> Positions<S, D> {
        self.current.load().positions()
    }
    pub fn size(&self) -> u64 {
        self.current.load().size()
    }
    pub fn bbox(&self) -> Option<Bounds<S, D>> {
        self.current.load().bbox()
    }
}

#[test]
fn test_grow_one_step() {
    use crate::bounds::point;

    let tree = GrowableTree::<i32, 2>::new([8, 8], 0).unwrap();
    assert_eq!(tree.set(&point([-1, -1]), true), Ok(true));
    assert_eq!(tree.height(), 1);
    assert_eq!(tree.offset(), point([-8, -8]));
    assert!(tree.get(&point([-1, -1])));
    assert!(!tree.get(&point([8, 8])));
    assert_eq!(tree.size(), 1);
    assert_eq!(tree.bbox(), Some(Bounds::point(point([-1, -1]))));
}

#[test]
fn test_out_of_bounds_false_is_noop() {
    use crate::bounds::point;

    let tree = GrowableTree::<i32, 2>::new([8, 8], 0).unwrap();
    assert_eq!(tree.set(&point([1000, -1000]), false), Ok(false));
    assert_eq!(tree.height(), 0);
    assert!(!tree.get(&point([1000, -1000])));
    assert_eq!(tree.height(), 0);
}

#[test]
fn test_grow_far() {
    use crate::bounds::point;

    let tree = GrowableTree::<i64, 3>::new([8, 8, 8], 0).unwrap();
    tree.set(&point([2, 3, 4]), true).unwrap();
    tree.set(&point([100_000, -5, 0]), true).unwrap();
    // 每翻倍一次距离长高一层
    assert_eq!(tree.height(), 14);
    assert!(tree.get(&point([2, 3, 4])));
    assert!(tree.get(&point([100_000, -5, 0])));
    assert!(!tree.get(&point([100_000, -4, 0])));
    tree.set(&point([-70_000, 9, 1]), true).unwrap();
    assert_eq!(tree.size(), 3);
    assert_eq!(
        tree.bbox(),
        Some(Bounds::new(point([-70_000, -5, 0]), point([100_000, 9, 4])))
    );
    let mut found: Vec<_> = tree.positions().map(|p| [p[0], p[1], p[2]]).collect();
    found.sort();
    assert_eq!(
        found,
        vec![[-70_000, 9, 1], [2, 3, 4], [100_000, -5, 0]]
    );
    for node in tree.nodes() {
        assert!(tree.bounds().contains(node.bounds()));
    }
}

#[test]
fn test_grow_overflow() {
    use crate::bounds::point;

    let tree = GrowableTree::<i16, 2>::new([8, 8], 0).unwrap();
    assert!(tree.set(&point([8000, 8000]), true).is_ok());
    assert_eq!(
        tree.set(&point([i16::MIN, 0]), true),
        Err(BitmaskError::HeightOverflow { height: 12, max: 11 })
    );
    assert!(tree.get(&point([8000, 8000])));
    assert!(!tree.get(&point([i16::MIN, 0])));
}

#[test]
fn test_random_growth_matches_model() {
    use std::collections::HashMap;

    use pcg_rand::Pcg32;
    use rand::{Rng, SeedableRng};

    use crate::bounds::point;

    let tree = GrowableTree::<i32, 2>::new([8, 8], 0).unwrap();
    let mut model = HashMap::new();
    let mut rng = Pcg32::seed_from_u64(5);
    for _ in 0..3000 {
        let p = [rng.gen_range(-200..200), rng.gen_range(-200..200)];
        let v = rng.gen_bool(0.7);
        tree.set(&point(p), v).unwrap();
        model.insert(p, v);
    }
    for (p, v) in model.iter() {
        assert_eq!(tree.get(&point(*p)), *v);
    }
    let count = model.values().filter(|v| **v).count() as u64;
    assert_eq!(tree.size(), count);
    assert_eq!(tree.positions().count() as u64, count);
    for p in tree.positions() {
        assert_eq!(model.get(&[p[0], p[1]]), Some(&true));
    }
    assert_eq!(tree.clear(), count > 0);
    assert_eq!(tree.size(), 0);
    assert_eq!(tree.bbox(), None);
    assert!(!tree.clear());
}

#[test]
fn test_clear_keeps_offset() {
    use crate::bounds::point;

    let tree = GrowableTree::<i32, 2>::new([8, 8], 0).unwrap();
    assert!(!tree.clear());
    tree.set(&point([-3, 20]), true).unwrap();
    // 写入后再清除，根已合并为false
    tree.set(&point([-3, 20]), false).unwrap();
    assert!(!tree.clear());
    tree.set(&point([-3, 20]), true).unwrap();
    let (height, offset) = (tree.height(), tree.offset());
    assert!(tree.clear());
    assert_eq!(tree.height(), height);
    assert_eq!(tree.offset(), offset);
    assert!(!tree.get(&point([-3, 20])));
    assert_eq!(tree.nodes().count(), 1);
}

#[test]
fn test_grow_offset_overflow() {
    use crate::bounds::point;

    // 偏移量已接近下限，再向下长高时偏移量无法表示
    let inner = Tree::<i16, 2>::new([8, 8], 0).unwrap();
    let snapshot = OffsetTree::new(inner, point([i16::MIN + 3, 0]));
    assert!(!snapshot.get(&point([i16::MIN + 3, 0])));
    assert_eq!(
        snapshot.grow_towards(&point([i16::MIN, 0])).unwrap_err(),
        BitmaskError::CoordinateOverflow
    );
    // 只在其它维度上方时不改变该维度的偏移量
    let grown = snapshot.grow_towards(&point([i16::MIN + 3, 100])).unwrap();
    assert_eq!(grown.offset(), &point([i16::MIN + 3, 0]));
    assert_eq!(grown.tree().height(), 1);
}

#[test]
fn test_concurrent_readers() {
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::bounds::point;

    let tree = GrowableTree::<i32, 2>::new([8, 8], 0).unwrap();
    let done = AtomicBool::new(false);
    std::thread::scope(|s| {
        for _ in 0..3 {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    // 写入方只写对角线，读取方看到的其它位置必须一直是false
                    for i in -40..40 {
                        assert!(!tree.get(&point([i, i + 1])));
                    }
                    let snapshot = tree.snapshot();
                    for p in snapshot.positions() {
                        assert_eq!(p[0], p[1]);
                    }
                }
            });
        }
        for round in 0..20 {
            for i in -300..300 {
                tree.set(&point([i, i]), round % 2 == 0).unwrap();
            }
        }
        done.store(true, Ordering::Release);
    });
    assert_eq!(tree.size(), 0);
    assert_eq!(tree.nodes().count(), 1);
}
