//! 八叉相关接口
//! 三维的稀疏位图，以及和parry3d的Aabb之间的转换。

use nalgebra::Point3;
use num_traits::NumCast;
use parry3d::{bounding_volume::Aabb, math::Real};

use crate::*;

/// 八叉树
pub type OctTree<S> = Tree<S, 3>;
/// 三维稀疏位图
pub type OctBitmask<S> = SparseBitmask<S, 3>;

/// 整数包围盒覆盖的区域，每个格子占据 [c, c + 1)
pub fn cell_aabb<S: Coord>(bounds: &Bounds<S, 3>) -> Aabb {
    let real = |v: S| v.to_f32().unwrap_or(Real::NAN);
    Aabb::new(
        Point3::new(
            real(bounds.mins[0]),
            real(bounds.mins[1]),
            real(bounds.mins[2]),
        ),
        Point3::new(
            real(bounds.maxs[0]) + 1.0,
            real(bounds.maxs[1]) + 1.0,
            real(bounds.maxs[2]) + 1.0,
        ),
    )
}

/// 中心点落在aabb内的所有格子
pub fn aabb_cells<S: Coord>(aabb: &Aabb) -> Result<Bounds<S, 3>> {
    let lo = |v: Real| -> Result<S> {
        NumCast::from((v - 0.5).ceil()).ok_or(BitmaskError::CoordinateOverflow)
    };
    let hi = |v: Real| -> Result<S> {
        NumCast::from((v - 0.5).floor()).ok_or(BitmaskError::CoordinateOverflow)
    };
    Ok(Bounds::new(
        point([lo(aabb.mins.x)?, lo(aabb.mins.y)?, lo(aabb.mins.z)?]),
        point([hi(aabb.maxs.x)?, hi(aabb.maxs.y)?, hi(aabb.maxs.z)?]),
    ))
}

/// 把中心点落在aabb内的所有格子写为value，返回改变的格子数
pub fn fill_aabb<S: Coord>(bitmask: &OctBitmask<S>, aabb: &Aabb, value: bool) -> Result<usize> {
    let mut changed = 0;
    for p in aabb_cells::<S>(aabb)?.cells() {
        if bitmask.set(&p, value)? {
            changed += 1;
        }
    }
    Ok(changed)
}

#[test]
fn test_fill_block() {
    let bitmask = OctBitmask::<i64>::new([8, 8, 8]).unwrap();
    let aabb = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(16.0, 8.0, 8.0));
    assert_eq!(fill_aabb(&bitmask, &aabb, true), Ok(16 * 8 * 8));
    // 两个叶子都收缩成了单值节点
    assert_eq!(bitmask.tree().nodes().count(), 1 + 8);
    let bounds = bitmask.view().bounds().unwrap().unwrap();
    assert_eq!(bounds, Bounds::new(point([0, 0, 0]), point([15, 7, 7])));
    assert_eq!(cell_aabb(&bounds).maxs, Point3::new(16.0, 8.0, 8.0));

    let hole = Aabb::new(Point3::new(3.0, 3.0, 3.0), Point3::new(5.0, 5.0, 5.0));
    assert_eq!(fill_aabb(&bitmask, &hole, false), Ok(8));
    assert_eq!(bitmask.view().size(), Ok(16 * 8 * 8 - 8));
    assert!(!bitmask.get(&point([4, 4, 4])));
    assert!(bitmask.get(&point([5, 4, 4])));
}
