//! 树上的统计算法：总数量和包围盒
//! 两者都只访问存储的节点，代价和节点数量相关，和区间的体积无关。

use crate::bounds::{widen, Bounds, Coord};
use crate::node::NodeData;
use crate::tree::Tree;

/// 为true的位置数量，超过u64时饱和
///
/// 全true的单值节点贡献整个区间的格子数，叶子位图贡献其计数，内部节点不直接贡献。
pub fn size<S: Coord, const D: usize>(tree: &Tree<S, D>) -> u64 {
    let mut total: u128 = 0;
    for node in tree.nodes() {
        match node.data() {
            NodeData::Uniform(true) => total = total.saturating_add(node.bounds().volume()),
            NodeData::Leaf(mask) => total = total.saturating_add(mask.count() as u128),
            _ => (),
        }
    }
    u64::try_from(total).unwrap_or(u64::MAX)
}

/// 所有为true的位置的最小包围盒，全false时返回None
///
/// 从根所在层到叶子层共height + 1轮，每轮以更细的一层为目标：
/// + outer：一定包含真实包围盒，目标层上还未细分的内部节点按整个区间计入；
/// + inner：一定被真实包围盒包含，只计入确定的部分（全true节点、叶子位图的精确包围盒）；
/// 下一轮跳过和outer不相交的节点（全为false），以及完全落在inner内的节点（不会再扩大结果）。
/// 最后一轮在叶子层，没有未细分的节点，outer即为真实包围盒。
pub fn bbox<S: Coord, const D: usize>(tree: &Tree<S, D>) -> Option<Bounds<S, D>> {
    let mut outer = *tree.bounds();
    let mut inner: Option<Bounds<S, D>> = None;
    for target in (0..=tree.height()).rev() {
        let mut next_outer = inner;
        let mut next_inner = inner;
        let mut nodes = tree.nodes();
        while let Some(node) = nodes.next() {
            let b = node.bounds();
            if !outer.intersects(b) || inner.map_or(false, |i| i.contains(b)) {
                nodes.prune();
                continue;
            }
            match node.data() {
                NodeData::Uniform(true) => {
                    widen(&mut next_outer, b);
                    widen(&mut next_inner, b);
                }
                NodeData::Uniform(false) => (),
                NodeData::Leaf(mask) => {
                    if let Some((lo, hi)) = mask.bounding_box() {
                        let mut exact = Bounds::new(b.mins, b.mins);
                        for d in 0..D {
                            exact.mins[d] = b.mins[d] + S::cast(lo[d]);
                            exact.maxs[d] = b.mins[d] + S::cast(hi[d]);
                        }
                        widen(&mut next_outer, &exact);
                        widen(&mut next_inner, &exact);
                    }
                }
                NodeData::Internal(_) => {
                    if node.level() <= target {
                        widen(&mut next_outer, b);
                        nodes.prune();
                    }
                }
            }
        }
        outer = next_outer?;
        inner = next_inner;
    }
    Some(outer)
}

#[cfg(test)]
fn brute_force<S: Coord, const D: usize>(
    tree: &Tree<S, D>,
    region: &Bounds<S, D>,
) -> (u64, Option<Bounds<S, D>>) {
    let mut count = 0;
    let mut found = None;
    for p in region.cells() {
        if tree.get(&p) {
            count += 1;
            widen(&mut found, &Bounds::point(p));
        }
    }
    (count, found)
}

#[test]
fn test_empty_tree() {
    let tree = Tree::<i32, 2>::new([8, 8], 3).unwrap();
    assert_eq!(size(&tree), 0);
    assert_eq!(bbox(&tree), None);
}

#[test]
fn test_bbox_mixed_nodes() {
    use crate::bounds::point;

    let tree = Tree::<i32, 2>::new([8, 8], 3).unwrap();
    tree.set(&point([9, 40]), true);
    tree.set(&point([50, 3]), true);
    assert_eq!(size(&tree), 2);
    assert_eq!(
        bbox(&tree),
        Some(Bounds::new(point([9, 3]), point([50, 40])))
    );
    // 一个全true的叶子
    for y in 56..64 {
        for x in 0..8 {
            tree.set(&point([x, y]), true);
        }
    }
    assert_eq!(size(&tree), 66);
    assert_eq!(
        bbox(&tree),
        Some(Bounds::new(point([0, 3]), point([50, 63])))
    );
}

#[test]
fn test_uniform_root() {
    use crate::bounds::point;

    let tree = Tree::<i64, 3>::new([8, 8, 8], 2).unwrap();
    for z in 0..32 {
        for y in 0..32 {
            for x in 0..32 {
                tree.set(&point([x, y, z]), true);
            }
        }
    }
    assert_eq!(tree.node_count(), 1);
    assert_eq!(size(&tree), 32 * 32 * 32);
    assert_eq!(
        bbox(&tree),
        Some(Bounds::new(point([0, 0, 0]), point([31, 31, 31])))
    );

    // 全true的根在长高后仍是一个单值节点
    let mut grown = tree.grow(7).unwrap();
    for _ in 0..30 {
        grown = grown.grow(0).unwrap();
    }
    assert_eq!(grown.height(), 33);
    assert_eq!(size(&grown), 32 * 32 * 32);
    assert_eq!(
        bbox(&grown),
        Some(Bounds::new(point([32, 32, 32]), point([63, 63, 63])))
    );
}

#[test]
fn test_size_bbox_random() {
    use pcg_rand::Pcg32;
    use rand::{Rng, SeedableRng};

    use crate::bounds::point;

    let mut rng = Pcg32::seed_from_u64(3);
    for round in 0..30 {
        let tree = Tree::<i32, 2>::new([8, 16], 2).unwrap();
        let region = *tree.bounds();
        let n = rng.gen_range(0..60);
        for _ in 0..n {
            let p = point([rng.gen_range(0..32), rng.gen_range(0..64)]);
            tree.set(&p, true);
        }
        // 部分轮次写入整块区域
        if round % 3 == 0 {
            let x0 = rng.gen_range(0..24);
            let y0 = rng.gen_range(0..48);
            for p in Bounds::new(point([x0, y0]), point([x0 + 7, y0 + 15])).cells() {
                tree.set(&p, true);
            }
        }
        let (count, expect) = brute_force(&tree, &region);
        assert_eq!(size(&tree), count);
        let got = bbox(&tree);
        assert_eq!(got, expect);
        // 每个面都至少接触一个为true的位置
        if let Some(b) = got {
            for d in 0..2 {
                assert!(tree.positions().any(|p| p[d] == b.mins[d]));
                assert!(tree.positions().any(|p| p[d] == b.maxs[d]));
            }
        }
    }
}
