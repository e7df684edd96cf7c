//! 叶子位图
//! 叶子的形状由Specification描述，所有维度的大小都是2的幂，第0维至少为8。
//! 位按行主序排列，第0维每8位打包成1个字节，所以每行总是字节对齐的。

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{BitmaskError, Result};

/// 最大维度，子节点数量为2的D次方
pub const MAX_DIMENSIONS: usize = 16;
/// 单个叶子最多的位数
pub const MAX_LEAF_BITS: usize = 1 << 31;

/// 叶子形状的描述，同一棵树的所有叶子共享一个
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Specification<const D: usize> {
    extent: [usize; D],
    shift: [usize; D],
    stride: [usize; D],
    size: usize,
}

impl<const D: usize> Specification<D> {
    /// 用各维度的叶子大小构建，大小不合法时返回错误
    pub fn new(extent: [usize; D]) -> Result<Self> {
        if D == 0 || D > MAX_DIMENSIONS {
            return Err(BitmaskError::InvalidDimensions(D));
        }
        for (dim, &e) in extent.iter().enumerate() {
            if !e.is_power_of_two() {
                return Err(BitmaskError::NotPowerOfTwo { dim, extent: e });
            }
        }
        let first = extent.first().copied().unwrap_or(0);
        if first < 8 {
            return Err(BitmaskError::FirstExtentTooSmall(first));
        }
        let mut stride = [0; D];
        let mut size = 1usize;
        for d in 0..D {
            stride[d] = size;
            size = size
                .checked_mul(extent[d])
                .filter(|s| *s <= MAX_LEAF_BITS)
                .ok_or(BitmaskError::CapacityOverflow)?;
        }
        Ok(Specification {
            extent,
            shift: extent.map(|e| e.trailing_zeros() as usize),
            stride,
            size,
        })
    }

    /// 从运行时长度的数组构建，长度必须等于D
    pub fn from_slice(extent: &[usize]) -> Result<Self> {
        let extent: [usize; D] =
            extent
                .try_into()
                .map_err(|_| BitmaskError::DimensionMismatch {
                    expected: D,
                    actual: extent.len(),
                })?;
        Self::new(extent)
    }

    #[inline]
    pub fn extent(&self) -> &[usize; D] {
        &self.extent
    }
    /// 各维度大小的log2
    #[inline]
    pub fn shift(&self) -> &[usize; D] {
        &self.shift
    }
    /// 各维度的坐标掩码
    #[inline]
    pub fn mask(&self, dim: usize) -> usize {
        self.extent[dim] - 1
    }
    /// 总位数
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
    /// 占用的字节数
    #[inline]
    pub fn bytes(&self) -> usize {
        self.size >> 3
    }
    #[inline]
    pub fn max_shift(&self) -> usize {
        self.shift.iter().copied().max().unwrap_or(0)
    }

    /// 坐标对应的位索引，坐标按叶子大小取模
    #[inline]
    pub fn index(&self, pos: &[usize; D]) -> usize {
        let mut i = 0;
        for d in 0..D {
            i += (pos[d] & self.mask(d)) * self.stride[d];
        }
        i
    }

    /// 位索引对应的坐标
    #[inline]
    pub fn position(&self, index: usize) -> [usize; D] {
        let mut pos = [0; D];
        let mut rest = index;
        for d in 0..D {
            pos[d] = rest & self.mask(d);
            rest >>= self.shift[d];
        }
        pos
    }
}

/// 叶子位图
///
/// 写入方只有一个，每次写入都是单个字节上的原子操作，读取方可以同时读。
#[derive(Debug)]
pub struct LeafBitmask<const D: usize> {
    spec: Arc<Specification<D>>,
    bits: Box<[AtomicU8]>,
    count: AtomicUsize,
}

impl<const D: usize> LeafBitmask<D> {
    /// 创建全部为value的位图
    pub fn new(spec: Arc<Specification<D>>, value: bool) -> Self {
        let fill = if value { u8::MAX } else { 0 };
        let bits = (0..spec.bytes()).map(|_| AtomicU8::new(fill)).collect();
        let count = if value { spec.size() } else { 0 };
        LeafBitmask {
            spec,
            bits,
            count: AtomicUsize::new(count),
        }
    }

    #[inline]
    pub fn specification(&self) -> &Arc<Specification<D>> {
        &self.spec
    }
    /// 为true的位数
    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
    /// 总位数
    #[inline]
    pub fn size(&self) -> usize {
        self.spec.size()
    }
    /// 全部相同时返回该值
    pub fn uniform(&self) -> Option<bool> {
        match self.count() {
            0 => Some(false),
            c if c == self.size() => Some(true),
            _ => None,
        }
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        self.bits[index >> 3].load(Ordering::Acquire) & (1 << (index & 7)) != 0
    }
    #[inline]
    pub fn get_at(&self, pos: &[usize; D]) -> bool {
        self.get(self.spec.index(pos))
    }

    /// 写入一位，返回这次写入是否使整个位图变得全同（全true或全false），
    /// 调用方据此把叶子收缩成单值节点
    pub fn set(&self, index: usize, value: bool) -> bool {
        let bit = 1u8 << (index & 7);
        let byte = &self.bits[index >> 3];
        let old = if value {
            byte.fetch_or(bit, Ordering::AcqRel)
        } else {
            byte.fetch_and(!bit, Ordering::AcqRel)
        };
        if (old & bit != 0) == value {
            return false;
        }
        let count = if value {
            self.count.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.count.fetch_sub(1, Ordering::AcqRel) - 1
        };
        count == 0 || count == self.size()
    }
    #[inline]
    pub fn set_at(&self, pos: &[usize; D], value: bool) -> bool {
        self.set(self.spec.index(pos), value)
    }

    /// 从from开始（含）查找下一个为true的位
    pub fn next_one(&self, from: usize) -> Option<usize> {
        if from >= self.size() {
            return None;
        }
        let mut i = from >> 3;
        let mut b = self.bits[i].load(Ordering::Acquire) & (u8::MAX << (from & 7));
        loop {
            if b != 0 {
                return Some((i << 3) + b.trailing_zeros() as usize);
            }
            i += 1;
            if i >= self.bits.len() {
                return None;
            }
            b = self.bits[i].load(Ordering::Acquire);
        }
    }

    /// 扫描存储，计算为true的位在叶子内的包围盒（闭区间），
    /// 第0维通过边界字节的最低位和最高位确定。没有为true的位时返回None
    pub fn bounding_box(&self) -> Option<([usize; D], [usize; D])> {
        if self.count() == 0 {
            return None;
        }
        let row_bytes = self.spec.extent()[0] >> 3;
        let mut min = [usize::MAX; D];
        let mut max = [0; D];
        let mut found = false;
        for (row, bytes) in self.bits.chunks(row_bytes).enumerate() {
            let first = bytes
                .iter()
                .position(|b| b.load(Ordering::Acquire) != 0);
            let first = match first {
                Some(f) => f,
                None => continue,
            };
            let last = bytes
                .iter()
                .rposition(|b| b.load(Ordering::Acquire) != 0)
                .unwrap_or(first);
            let lo = bytes[first].load(Ordering::Acquire);
            let hi = bytes[last].load(Ordering::Acquire);
            // 读取期间可能被同时写入，读到0时退回字节边界
            let x0 = (first << 3) + if lo == 0 { 0 } else { lo.trailing_zeros() as usize };
            let x1 = (last << 3) + if hi == 0 { 7 } else { 7 - hi.leading_zeros() as usize };
            min[0] = min[0].min(x0);
            max[0] = max[0].max(x1);
            let pos = self.spec.position(row * self.spec.extent()[0]);
            for d in 1..D {
                min[d] = min[d].min(pos[d]);
                max[d] = max[d].max(pos[d]);
            }
            found = true;
        }
        if found {
            Some((min, max))
        } else {
            None
        }
    }
}

#[test]
fn test_specification() {
    let spec = Specification::new([8usize, 4, 2]).unwrap();
    assert_eq!(spec.size(), 64);
    assert_eq!(spec.bytes(), 8);
    assert_eq!(spec.shift(), &[3, 2, 1]);
    assert_eq!(spec.max_shift(), 3);
    assert_eq!(spec.index(&[0, 0, 0]), 0);
    assert_eq!(spec.index(&[1, 0, 0]), 1);
    assert_eq!(spec.index(&[0, 1, 0]), 8);
    assert_eq!(spec.index(&[0, 0, 1]), 32);
    // 坐标按叶子大小取模
    assert_eq!(spec.index(&[9, 5, 3]), spec.index(&[1, 1, 1]));
    for i in 0..spec.size() {
        assert_eq!(spec.index(&spec.position(i)), i);
    }
}

#[test]
fn test_specification_errors() {
    assert_eq!(
        Specification::new([8usize, 3]),
        Err(BitmaskError::NotPowerOfTwo { dim: 1, extent: 3 })
    );
    assert_eq!(
        Specification::new([4usize, 8]),
        Err(BitmaskError::FirstExtentTooSmall(4))
    );
    assert_eq!(
        Specification::new([8usize, 0]),
        Err(BitmaskError::NotPowerOfTwo { dim: 1, extent: 0 })
    );
    assert_eq!(
        Specification::<0>::new([]),
        Err(BitmaskError::InvalidDimensions(0))
    );
    assert_eq!(
        Specification::new([1usize << 16, 1 << 16]),
        Err(BitmaskError::CapacityOverflow)
    );
    assert_eq!(
        Specification::<2>::from_slice(&[8, 8, 8]),
        Err(BitmaskError::DimensionMismatch {
            expected: 2,
            actual: 3
        })
    );
    assert!(Specification::<2>::from_slice(&[8, 8]).is_ok());
}

#[test]
fn test_leaf_set_get_uniform() {
    let spec = Arc::new(Specification::new([8usize, 2]).unwrap());
    let leaf = LeafBitmask::new(spec.clone(), false);
    assert_eq!(leaf.uniform(), Some(false));
    assert!(!leaf.set_at(&[3, 1], true));
    assert!(leaf.get_at(&[3, 1]));
    assert!(!leaf.get_at(&[3, 0]));
    assert_eq!(leaf.count(), 1);
    // 重复写入不改变计数
    assert!(!leaf.set_at(&[3, 1], true));
    assert_eq!(leaf.count(), 1);
    // 最后一位清掉时报告全同
    assert!(leaf.set_at(&[3, 1], false));
    assert_eq!(leaf.uniform(), Some(false));

    let full = LeafBitmask::new(spec.clone(), true);
    assert_eq!(full.count(), 16);
    assert!(!full.set(5, false));
    assert!(full.set(5, true));
    assert_eq!(full.uniform(), Some(true));
}

#[test]
fn test_leaf_next_one() {
    let spec = Arc::new(Specification::new([16usize, 2]).unwrap());
    let leaf = LeafBitmask::new(spec, false);
    for i in [2usize, 9, 10, 31] {
        leaf.set(i, true);
    }
    let mut found = Vec::new();
    let mut from = 0;
    while let Some(i) = leaf.next_one(from) {
        found.push(i);
        from = i + 1;
    }
    assert_eq!(found, vec![2, 9, 10, 31]);
    assert_eq!(leaf.next_one(32), None);
}

#[test]
fn test_leaf_bounding_box() {
    let spec = Arc::new(Specification::new([16usize, 4, 2]).unwrap());
    let leaf = LeafBitmask::new(spec, false);
    assert_eq!(leaf.bounding_box(), None);
    leaf.set_at(&[5, 2, 0], true);
    assert_eq!(leaf.bounding_box(), Some(([5, 2, 0], [5, 2, 0])));
    leaf.set_at(&[12, 1, 1], true);
    leaf.set_at(&[9, 3, 0], true);
    assert_eq!(leaf.bounding_box(), Some(([5, 1, 0], [12, 3, 1])));
    leaf.set_at(&[0, 0, 1], true);
    leaf.set_at(&[15, 0, 1], true);
    assert_eq!(leaf.bounding_box(), Some(([0, 0, 0], [15, 3, 1])));
}

#[test]
fn test_leaf_bounding_box_random() {
    use pcg_rand::Pcg32;
    use rand::{Rng, SeedableRng};

    let spec = Arc::new(Specification::new([32usize, 8]).unwrap());
    let mut rng = Pcg32::seed_from_u64(7);
    for _ in 0..50 {
        let leaf = LeafBitmask::new(spec.clone(), false);
        let mut min = [usize::MAX; 2];
        let mut max = [0usize; 2];
        for _ in 0..rng.gen_range(1..20) {
            let p = [rng.gen_range(0..32), rng.gen_range(0..8)];
            leaf.set_at(&p, true);
            for d in 0..2 {
                min[d] = min[d].min(p[d]);
                max[d] = max[d].max(p[d]);
            }
        }
        assert_eq!(leaf.bounding_box(), Some((min, max)));
    }
}
