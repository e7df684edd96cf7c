//! 四叉相关接口
//! 二维的稀疏位图，以及和parry2d的Aabb之间的转换。

use nalgebra::Point2;
use num_traits::NumCast;
use parry2d::{bounding_volume::Aabb, math::Real};

use crate::*;

/// 四叉树
pub type QuadTree<S> = Tree<S, 2>;
/// 二维稀疏位图
pub type QuadBitmask<S> = SparseBitmask<S, 2>;

/// 整数包围盒覆盖的区域，每个格子占据 [c, c + 1)
pub fn cell_aabb<S: Coord>(bounds: &Bounds<S, 2>) -> Aabb {
    let real = |v: S| v.to_f32().unwrap_or(Real::NAN);
    Aabb::new(
        Point2::new(real(bounds.mins[0]), real(bounds.mins[1])),
        Point2::new(
            real(bounds.maxs[0]) + 1.0,
            real(bounds.maxs[1]) + 1.0,
        ),
    )
}

/// 中心点落在aabb内的所有格子
pub fn aabb_cells<S: Coord>(aabb: &Aabb) -> Result<Bounds<S, 2>> {
    let lo = |v: Real| -> Result<S> {
        NumCast::from((v - 0.5).ceil()).ok_or(BitmaskError::CoordinateOverflow)
    };
    let hi = |v: Real| -> Result<S> {
        NumCast::from((v - 0.5).floor()).ok_or(BitmaskError::CoordinateOverflow)
    };
    Ok(Bounds::new(
        point([lo(aabb.mins.x)?, lo(aabb.mins.y)?]),
        point([hi(aabb.maxs.x)?, hi(aabb.maxs.y)?]),
    ))
}

/// 把中心点落在aabb内的所有格子写为value，返回改变的格子数
pub fn fill_aabb<S: Coord>(bitmask: &QuadBitmask<S>, aabb: &Aabb, value: bool) -> Result<usize> {
    let mut changed = 0;
    for p in aabb_cells::<S>(aabb)?.cells() {
        if bitmask.set(&p, value)? {
            changed += 1;
        }
    }
    Ok(changed)
}

#[test]
fn test_fill_aabb() {
    let bitmask = QuadBitmask::<i32>::new([8, 8]).unwrap();
    let aabb = Aabb::new(Point2::new(-2.0, 1.2), Point2::new(1.0, 3.4));
    // x中心 -1.5 -0.5 0.5，y中心 1.5 2.5
    assert_eq!(fill_aabb(&bitmask, &aabb, true), Ok(6));
    let view = bitmask.view();
    assert_eq!(view.size(), Ok(6));
    let bounds = view.bounds().unwrap().unwrap();
    assert_eq!(bounds, Bounds::new(point([-2, 1]), point([0, 2])));
    let covered = cell_aabb(&bounds);
    assert_eq!(covered.mins, Point2::new(-2.0, 1.0));
    assert_eq!(covered.maxs, Point2::new(1.0, 3.0));

    assert_eq!(fill_aabb(&bitmask, &aabb, true), Ok(0));
    assert_eq!(fill_aabb(&bitmask, &aabb, false), Ok(6));
    assert_eq!(bitmask.view().size(), Ok(0));
}

#[test]
fn test_aabb_without_centers() {
    let aabb = Aabb::new(Point2::new(0.6, 0.0), Point2::new(1.4, 4.0));
    let cells = aabb_cells::<i64>(&aabb).unwrap();
    assert_eq!(cells.cells().count(), 0);
}
