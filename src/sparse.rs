//! 稀疏位图
//! 把可增长的树包装成按坐标随机读写的布尔场，并提供只读视图：总数量、包围盒、所有为true的位置。
//! 每次改变存储值的写入都会增加修改计数，视图创建后计数变化则视图失效。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use nalgebra::Point;

use crate::bounds::{Bounds, Coord};
use crate::error::{BitmaskError, Result};
use crate::growable::{GrowableTree, OffsetTree};
use crate::node::Positions;

/// 稀疏位图，未写入过的位置都为false
#[derive(Debug)]
pub struct SparseBitmask<S: Coord, const D: usize> {
    tree: GrowableTree<S, D>,
    modifications: AtomicU64,
}

impl<S: Coord, const D: usize> SparseBitmask<S, D> {
    /// 用各维度的叶子大小构建，叶子大小必须是2的幂，第0维至少为8
    pub fn new(extent: [usize; D]) -> Result<Self> {
        Self::with_height(extent, 0)
    }

    /// 指定初始高度，预先覆盖 [0, extent * 2^height - 1] 的区间
    pub fn with_height(extent: [usize; D], height: usize) -> Result<Self> {
        Ok(SparseBitmask {
            tree: GrowableTree::new(extent, height)?,
            modifications: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn tree(&self) -> &GrowableTree<S, D> {
        &self.tree
    }
    /// 修改计数
    #[inline]
    pub fn modifications(&self) -> u64 {
        self.modifications.load(Ordering::Acquire)
    }

    pub fn get(&self, pos: &Point<S, D>) -> bool {
        self.tree.get(pos)
    }

    /// 写入，返回存储的值是否改变
    pub fn set(&self, pos: &Point<S, D>, value: bool) -> Result<bool> {
        let changed = self.tree.set(pos, value)?;
        if changed {
            self.modifications.fetch_add(1, Ordering::AcqRel);
        }
        Ok(changed)
    }

    /// 用运行时长度的坐标读取，长度必须等于D
    pub fn get_slice(&self, coords: &[S]) -> Result<bool> {
        Ok(self.get(&to_point(coords)?))
    }

    /// 用运行时长度的坐标写入，长度必须等于D
    pub fn set_slice(&self, coords: &[S], value: bool) -> Result<bool> {
        self.set(&to_point(coords)?, value)
    }

    /// 全部置为false
    pub fn clear(&self) {
        if self.tree.clear() {
            self.modifications.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// 只读视图，数量和包围盒在第一次使用时计算
    pub fn view(&self) -> BitmaskView<'_, S, D> {
        BitmaskView {
            owner: self,
            captured: self.modifications(),
            snapshot: self.tree.snapshot(),
            size: OnceLock::new(),
            bbox: OnceLock::new(),
        }
    }
}

fn to_point<S: Coord, const D: usize>(coords: &[S]) -> Result<Point<S, D>> {
    let arr: [S; D] = coords
        .try_into()
        .map_err(|_| BitmaskError::DimensionMismatch {
            expected: D,
            actual: coords.len(),
        })?;
    Ok(Point::from(arr))
}

fn check_dim<const D: usize>(dim: usize) -> Result<()> {
    if dim >= D {
        return Err(BitmaskError::DimensionOutOfRange { dim, dimensions: D });
    }
    Ok(())
}

/// 稀疏位图的只读视图
///
/// 视图不阻止写入，只在使用时检查修改计数，发现变化返回Stale错误，需要重新获取视图。
#[derive(Debug)]
pub struct BitmaskView<'a, S: Coord, const D: usize> {
    owner: &'a SparseBitmask<S, D>,
    captured: u64,
    snapshot: Arc<OffsetTree<S, D>>,
    size: OnceLock<u64>,
    bbox: OnceLock<Option<Bounds<S, D>>>,
}

impl<'a, S: Coord, const D: usize> BitmaskView<'a, S, D> {
    /// 检查视图是否仍然有效
    pub fn check(&self) -> Result<()> {
        let current = self.owner.modifications();
        if current != self.captured {
            return Err(BitmaskError::Stale {
                captured: self.captured,
                current,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn is_stale(&self) -> bool {
        self.check().is_err()
    }

    /// 为true的位置数量
    pub fn size(&self) -> Result<u64> {
        self.check()?;
        let size = *self.size.get_or_init(|| self.snapshot.size());
        // 计算期间有写入完成时结果不可用，计数只增不减，缓存的值之后也不会再返回
        self.check()?;
        Ok(size)
    }

    /// 包围盒，全false时为None
    pub fn bounds(&self) -> Result<Option<Bounds<S, D>>> {
        self.check()?;
        let bbox = *self.bbox.get_or_init(|| self.snapshot.bbox());
        self.check()?;
        Ok(bbox)
    }

    /// 包围盒在dim维度上的最小值
    pub fn min(&self, dim: usize) -> Result<Option<S>> {
        check_dim::<D>(dim)?;
        Ok(self.bounds()?.map(|b| b.mins[dim]))
    }

    /// 包围盒在dim维度上的最大值
    pub fn max(&self, dim: usize) -> Result<Option<S>> {
        check_dim::<D>(dim)?;
        Ok(self.bounds()?.map(|b| b.maxs[dim]))
    }

    /// 所有为true的位置，可以多次获取，顺序在同一个位图上是稳定的
    pub fn iter(&self) -> Result<TruePositions<'_, 'a, S, D>> {
        self.check()?;
        Ok(TruePositions {
            view: self,
            inner: self.snapshot.positions(),
            done: false,
        })
    }
}

/// 视图上为true的位置的迭代器，每一步都检查视图是否失效，失效时返回一次错误后结束
#[derive(Debug)]
pub struct TruePositions<'v, 'a, S: Coord, const D: usize> {
    view: &'v BitmaskView<'a, S, D>,
    inner: Positions<S, D>,
    done: bool,
}

impl<'v, 'a, S: Coord, const D: usize> Iterator for TruePositions<'v, 'a, S, D> {
    type Item = Result<Point<S, D>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Err(e) = self.view.check() {
            self.done = true;
            return Some(Err(e));
        }
        let p = self.inner.next();
        if p.is_none() {
            self.done = true;
        }
        p.map(Ok)
    }
}

#[test]
fn test_scenario_single_leaf() {
    use crate::bounds::point;

    let mask = SparseBitmask::<i32, 2>::new([8, 8]).unwrap();
    assert_eq!(mask.set(&point([3, 3]), true), Ok(true));
    assert!(mask.get(&point([3, 3])));
    assert!(!mask.get(&point([0, 0])));
    let view = mask.view();
    assert_eq!(view.size(), Ok(1));
    assert_eq!(view.min(0), Ok(Some(3)));
    assert_eq!(view.max(1), Ok(Some(3)));
    assert_eq!(mask.tree().height(), 0);
}

#[test]
fn test_view_staleness() {
    use crate::bounds::point;

    let mask = SparseBitmask::<i64, 2>::new([8, 8]).unwrap();
    mask.set(&point([1, 1]), true).unwrap();
    mask.set(&point([-20, 5]), true).unwrap();
    let view = mask.view();
    assert_eq!(view.size(), Ok(2));
    let found: Vec<_> = view.iter().unwrap().collect::<Result<_>>().unwrap();
    assert_eq!(found.len(), 2);
    // 可以重复获取
    assert_eq!(view.iter().unwrap().count(), 2);

    // 写入相同的值不算修改
    assert_eq!(mask.set(&point([1, 1]), true), Ok(false));
    assert!(!view.is_stale());

    let mut iter = view.iter().unwrap();
    assert!(iter.next().unwrap().is_ok());
    mask.set(&point([2, 2]), true).unwrap();
    assert_eq!(
        iter.next(),
        Some(Err(BitmaskError::Stale {
            captured: 2,
            current: 3
        }))
    );
    assert_eq!(iter.next(), None);
    assert!(view.is_stale());
    assert!(view.size().is_err());
    assert!(view.bounds().is_err());
    assert!(view.iter().is_err());

    let fresh = mask.view();
    assert_eq!(fresh.size(), Ok(3));
    assert_eq!(
        fresh.bounds(),
        Ok(Some(Bounds::new(point([-20, 1]), point([2, 5]))))
    );
}

#[test]
fn test_view_dimension_out_of_range() {
    use crate::bounds::point;

    let mask = SparseBitmask::<i32, 2>::new([8, 8]).unwrap();
    let view = mask.view();
    assert_eq!(
        view.min(2),
        Err(BitmaskError::DimensionOutOfRange {
            dim: 2,
            dimensions: 2
        })
    );
    mask.set(&point([1, 1]), true).unwrap();
    let view = mask.view();
    assert_eq!(view.min(1), Ok(Some(1)));
    assert_eq!(
        view.min(2),
        Err(BitmaskError::DimensionOutOfRange {
            dim: 2,
            dimensions: 2
        })
    );
    assert!(view.max(usize::MAX).is_err());
}

#[test]
fn test_view_during_writes() {
    use std::sync::atomic::AtomicBool;

    use crate::bounds::point;

    let mask = SparseBitmask::<i32, 2>::new([8, 8]).unwrap();
    let done = AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| {
            // 每次写入都新增一个为true的位置，修改计数等于写入完成的数量
            for i in 0..4000 {
                mask.set(&point([i, 0]), true).unwrap();
            }
            done.store(true, Ordering::Release);
        });
        while !done.load(Ordering::Acquire) {
            let view = mask.view();
            let captured = view.captured;
            if let Ok(size) = view.size() {
                // 最多还有一次写入正在进行
                assert!(size == captured || size == captured + 1);
            }
            if let Ok(Some(b)) = view.bounds() {
                let len = (b.maxs[0] + 1) as u64;
                assert!(len == captured || len == captured + 1);
            }
        }
    });
    let view = mask.view();
    assert_eq!(view.size(), Ok(4000));
    mask.set(&point([0, 0]), false).unwrap();
    assert!(view.size().is_err());
    assert!(view.bounds().is_err());
}

#[test]
fn test_slice_coordinates() {
    let mask = SparseBitmask::<i32, 3>::new([8, 4, 4]).unwrap();
    assert_eq!(mask.set_slice(&[1, 2, 3], true), Ok(true));
    assert_eq!(mask.get_slice(&[1, 2, 3]), Ok(true));
    assert_eq!(
        mask.get_slice(&[1, 2]),
        Err(BitmaskError::DimensionMismatch {
            expected: 3,
            actual: 2
        })
    );
    assert!(mask.set_slice(&[1, 2, 3, 4], true).is_err());
    assert_eq!(mask.modifications(), 1);
}

#[test]
fn test_invalid_construction() {
    assert_eq!(
        SparseBitmask::<i32, 2>::new([6, 8]).unwrap_err(),
        BitmaskError::NotPowerOfTwo { dim: 0, extent: 6 }
    );
    assert_eq!(
        SparseBitmask::<i32, 2>::new([4, 8]).unwrap_err(),
        BitmaskError::FirstExtentTooSmall(4)
    );
    assert!(SparseBitmask::<i32, 2>::with_height([8, 8], 40).is_err());
}

#[test]
fn test_clear() {
    use crate::bounds::point;

    let mask = SparseBitmask::<i32, 2>::new([8, 8]).unwrap();
    mask.clear();
    assert_eq!(mask.modifications(), 0);
    for i in 0..50 {
        mask.set(&point([i * 3, -i]), true).unwrap();
    }
    let view = mask.view();
    assert_eq!(view.size(), Ok(50));
    mask.clear();
    assert!(view.is_stale());
    assert_eq!(mask.view().size(), Ok(0));
    assert_eq!(mask.view().bounds(), Ok(None));
    assert!(!mask.get(&point([3, -1])));
}

#[test]
fn test_symmetry_random() {
    use pcg_rand::Pcg32;
    use rand::{Rng, SeedableRng};

    use crate::bounds::point;

    let mask = SparseBitmask::<i32, 2>::with_height([8, 8], 2).unwrap();
    let mut rng = Pcg32::seed_from_u64(9);
    for _ in 0..200 {
        mask.set(&point([rng.gen_range(0..32), rng.gen_range(0..32)]), true)
            .unwrap();
    }
    let size = mask.view().size().unwrap();
    for _ in 0..200 {
        let p = point([rng.gen_range(-64..96), rng.gen_range(-64..96)]);
        if mask.get(&p) {
            continue;
        }
        let height = mask.tree().height();
        let nodes = mask.tree().nodes().count();
        mask.set(&p, true).unwrap();
        assert!(mask.get(&p));
        mask.set(&p, false).unwrap();
        assert!(!mask.get(&p));
        // 没有长高时，写入后再清除结构复原
        if mask.tree().height() == height {
            assert_eq!(mask.tree().nodes().count(), nodes);
        }
    }
    assert_eq!(mask.view().size(), Ok(size));
}
