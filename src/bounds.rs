//! 整数坐标及闭区间包围盒

use nalgebra::{Point, Scalar};
use num_traits::{AsPrimitive, PrimInt, Signed};

/// 坐标的数值类型
///
/// ### 对`S`的约束
///
/// + 有符号整数，可拷贝，可全序比较，支持位运算；
/// + 实际使用的时候就是整数类型，比如：i32/i64；
///
pub trait Coord: Scalar + PrimInt + Signed + AsPrimitive<usize> + Send + Sync {
    /// 位宽
    const BITS: usize;
    /// 由usize转换，调用方保证数值在范围内
    fn cast(v: usize) -> Self;
}

macro_rules! impl_coord {
    ($($t:ty),*) => {
        $(
            impl Coord for $t {
                const BITS: usize = <$t>::BITS as usize;
                #[inline]
                fn cast(v: usize) -> Self {
                    v as $t
                }
            }
        )*
    };
}
impl_coord!(i16, i32, i64, i128, isize);

/// 由数组构建坐标点
#[inline]
pub fn point<S: Coord, const D: usize>(coords: [S; D]) -> Point<S, D> {
    Point::from(coords)
}

/// 闭区间包围盒，mins和maxs都包含在内
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds<S: Coord, const D: usize> {
    pub mins: Point<S, D>,
    pub maxs: Point<S, D>,
}

impl<S: Coord, const D: usize> Bounds<S, D> {
    #[inline]
    pub fn new(mins: Point<S, D>, maxs: Point<S, D>) -> Self {
        Bounds { mins, maxs }
    }
    /// 只包含一个点的包围盒
    #[inline]
    pub fn point(p: Point<S, D>) -> Self {
        Bounds { mins: p, maxs: p }
    }
    /// 判断是否包含指定点
    pub fn contains_point(&self, p: &Point<S, D>) -> bool {
        (0..D).all(|d| self.mins[d] <= p[d] && p[d] <= self.maxs[d])
    }
    /// 判断是否包含另一个包围盒
    pub fn contains(&self, other: &Self) -> bool {
        (0..D).all(|d| self.mins[d] <= other.mins[d] && other.maxs[d] <= self.maxs[d])
    }
    /// 判断2个包围盒是否相交
    pub fn intersects(&self, other: &Self) -> bool {
        (0..D).all(|d| self.mins[d] <= other.maxs[d] && other.mins[d] <= self.maxs[d])
    }
    /// 扩大到同时包含other
    pub fn merge(&mut self, other: &Self) {
        for d in 0..D {
            self.mins[d] = self.mins[d].min(other.mins[d]);
            self.maxs[d] = self.maxs[d].max(other.maxs[d]);
        }
    }
    /// 平移
    pub fn translate(&self, offset: &Point<S, D>) -> Self {
        let mut r = *self;
        for d in 0..D {
            r.mins[d] = r.mins[d] + offset[d];
            r.maxs[d] = r.maxs[d] + offset[d];
        }
        r
    }
    /// 包含的格子数量，溢出时饱和
    pub fn volume(&self) -> u128 {
        (0..D).fold(1u128, |acc, d| {
            let side = AsPrimitive::<usize>::as_(self.maxs[d] - self.mins[d]) as u128 + 1;
            acc.saturating_mul(side)
        })
    }
    /// 逐格遍历，第0维变化最快
    pub fn cells(&self) -> Cells<S, D> {
        let valid = (0..D).all(|d| self.mins[d] <= self.maxs[d]);
        Cells {
            bounds: *self,
            next: if valid { Some(self.mins) } else { None },
        }
    }
}

/// 包围盒内所有格子的迭代器
#[derive(Debug, Clone)]
pub struct Cells<S: Coord, const D: usize> {
    bounds: Bounds<S, D>,
    next: Option<Point<S, D>>,
}

impl<S: Coord, const D: usize> Iterator for Cells<S, D> {
    type Item = Point<S, D>;

    fn next(&mut self) -> Option<Self::Item> {
        let p = self.next.take()?;
        let mut q = p;
        for d in 0..D {
            if q[d] < self.bounds.maxs[d] {
                q[d] = q[d] + S::one();
                self.next = Some(q);
                break;
            }
            q[d] = self.bounds.mins[d];
        }
        Some(p)
    }
}

/// 将b合并进可能为空的包围盒
#[inline]
pub fn widen<S: Coord, const D: usize>(target: &mut Option<Bounds<S, D>>, b: &Bounds<S, D>) {
    match target {
        Some(t) => t.merge(b),
        None => *target = Some(*b),
    }
}

#[test]
fn test_bounds_relations() {
    let a = Bounds::new(point([0i32, 0]), point([7, 7]));
    let b = Bounds::new(point([4i32, 4]), point([9, 5]));
    let c = Bounds::new(point([8i32, 0]), point([9, 3]));
    assert!(a.intersects(&b));
    assert!(!a.intersects(&c));
    assert!(!a.contains(&b));
    assert!(a.contains(&Bounds::point(point([7, 0]))));
    assert!(a.contains_point(&point([0, 7])));
    assert!(!a.contains_point(&point([-1, 3])));

    let mut m = a;
    m.merge(&c);
    assert_eq!(m, Bounds::new(point([0, 0]), point([9, 7])));
    assert_eq!(m.volume(), 80);
    assert_eq!(
        c.translate(&point([-8, 2])),
        Bounds::new(point([0, 2]), point([1, 5]))
    );

    let mut acc = None;
    widen(&mut acc, &c);
    widen(&mut acc, &Bounds::point(point([3, 9])));
    assert_eq!(acc, Some(Bounds::new(point([3, 0]), point([9, 9]))));
}

#[test]
fn test_cells() {
    let b = Bounds::new(point([-1i64, 5]), point([1, 6]));
    let cells: Vec<_> = b.cells().map(|p| [p[0], p[1]]).collect();
    assert_eq!(
        cells,
        vec![[-1, 5], [0, 5], [1, 5], [-1, 6], [0, 6], [1, 6]]
    );
    assert_eq!(b.cells().count() as u128, b.volume());
    let empty = Bounds::new(point([2i64, 0]), point([1, 0]));
    assert_eq!(empty.cells().count(), 0);
}
