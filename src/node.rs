//! 树节点及遍历
//! 节点只有三种状态：单值、叶子位图、内部节点（2的D次方个子节点）。
//! 每个子节点槽位都是ArcSwap，状态转换时先完整构建新节点再一次性发布，
//! 读取方看到的要么是转换前的节点，要么是转换后的节点。

use std::sync::Arc;

use arc_swap::ArcSwap;
use nalgebra::Point;

use crate::bitmask::{LeafBitmask, Specification};
use crate::bounds::{Bounds, Cells, Coord};

/// 节点数据
#[derive(Debug)]
pub enum NodeData<const D: usize> {
    /// 整个区域全为同一个值
    Uniform(bool),
    /// 叶子层的位图
    Leaf(LeafBitmask<D>),
    /// 内部节点，子节点按各维度的位组合排列，第d维为大的一半时第d位为1
    Internal(Box<[ArcSwap<NodeData<D>>]>),
}

impl<const D: usize> NodeData<D> {
    /// 分裂成内部节点，所有子节点都指向fill
    pub fn split(fill: &Arc<NodeData<D>>) -> Self {
        let children = (0..1usize << D)
            .map(|_| ArcSwap::new(fill.clone()))
            .collect();
        NodeData::Internal(children)
    }

    /// 分裂成内部节点，index位置放入child，其余都指向fill
    pub fn embed(child: Arc<NodeData<D>>, index: usize, fill: &Arc<NodeData<D>>) -> Self {
        let children = (0..1usize << D)
            .map(|i| {
                if i == index {
                    ArcSwap::new(child.clone())
                } else {
                    ArcSwap::new(fill.clone())
                }
            })
            .collect();
        NodeData::Internal(children)
    }

    #[inline]
    pub fn value(&self) -> Option<bool> {
        match self {
            NodeData::Uniform(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn bitmask(&self) -> Option<&LeafBitmask<D>> {
        match self {
            NodeData::Leaf(mask) => Some(mask),
            _ => None,
        }
    }

    #[inline]
    pub fn children(&self) -> Option<&[ArcSwap<NodeData<D>>]> {
        match self {
            NodeData::Internal(children) => Some(children),
            _ => None,
        }
    }

    /// 内部节点的所有子节点都是同一个单值时返回该值，可以合并
    pub fn uniform_children(&self) -> Option<bool> {
        let children = self.children()?;
        let first = children.first()?.load().value()?;
        children[1..]
            .iter()
            .all(|c| c.load().value() == Some(first))
            .then_some(first)
    }
}

/// 遍历时的节点视图，包含节点所在的层和区间
#[derive(Debug, Clone)]
pub struct Node<S: Coord, const D: usize> {
    data: Arc<NodeData<D>>,
    level: usize,
    bounds: Bounds<S, D>,
}

impl<S: Coord, const D: usize> Node<S, D> {
    pub fn new(data: Arc<NodeData<D>>, level: usize, bounds: Bounds<S, D>) -> Self {
        Node {
            data,
            level,
            bounds,
        }
    }
    #[inline]
    pub fn data(&self) -> &NodeData<D> {
        &self.data
    }
    /// 所在层，0为叶子层
    #[inline]
    pub fn level(&self) -> usize {
        self.level
    }
    #[inline]
    pub fn bounds(&self) -> &Bounds<S, D> {
        &self.bounds
    }
    #[inline]
    pub fn value(&self) -> Option<bool> {
        self.data.value()
    }
    #[inline]
    pub fn bitmask(&self) -> Option<&LeafBitmask<D>> {
        self.data.bitmask()
    }
    #[inline]
    pub fn is_internal(&self) -> bool {
        matches!(*self.data, NodeData::Internal(_))
    }
    /// 平移区间
    pub fn translate(mut self, offset: &Point<S, D>) -> Self {
        self.bounds = self.bounds.translate(offset);
        self
    }
}

/// 深度优先的节点迭代器
///
/// 内部节点被返回后，下一次调用next时才展开其子节点，
/// 在此之前调用prune可以跳过整个子树。
#[derive(Debug, Clone)]
pub struct NodeIter<S: Coord, const D: usize> {
    spec: Arc<Specification<D>>,
    stack: Vec<Node<S, D>>,
    expand: Option<Node<S, D>>,
}

impl<S: Coord, const D: usize> NodeIter<S, D> {
    pub fn new(spec: Arc<Specification<D>>, root: Node<S, D>) -> Self {
        NodeIter {
            spec,
            stack: vec![root],
            expand: None,
        }
    }

    /// 不再展开上一次返回的节点
    #[inline]
    pub fn prune(&mut self) {
        self.expand = None;
    }

    // 子节点压栈，逆序压入使0号子节点先出栈
    fn push_children(&mut self, parent: &Node<S, D>) {
        let children = match parent.data.children() {
            Some(c) => c,
            None => return,
        };
        let level = parent.level - 1;
        let extent = self.spec.extent();
        for i in (0..children.len()).rev() {
            let mut bounds = parent.bounds;
            for d in 0..D {
                let side = S::cast(extent[d]) << level;
                if i >> d & 1 != 0 {
                    bounds.mins[d] = bounds.mins[d] + side;
                }
                bounds.maxs[d] = bounds.mins[d] + (side - S::one());
            }
            self.stack
                .push(Node::new(children[i].load_full(), level, bounds));
        }
    }
}

impl<S: Coord, const D: usize> Iterator for NodeIter<S, D> {
    type Item = Node<S, D>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(parent) = self.expand.take() {
            self.push_children(&parent);
        }
        let node = self.stack.pop()?;
        if node.is_internal() {
            self.expand = Some(node.clone());
        }
        Some(node)
    }
}

// 正在展开的节点
#[derive(Debug, Clone)]
enum Cursor<S: Coord, const D: usize> {
    // 全true节点，逐格返回
    Block(Cells<S, D>),
    // 叶子位图，from为下一次查找的起始位
    Leaf { node: Node<S, D>, from: usize },
}

/// 所有为true的位置的迭代器，顺序为节点的深度优先顺序
#[derive(Debug, Clone)]
pub struct Positions<S: Coord, const D: usize> {
    nodes: NodeIter<S, D>,
    cursor: Option<Cursor<S, D>>,
}

impl<S: Coord, const D: usize> Positions<S, D> {
    pub fn new(nodes: NodeIter<S, D>) -> Self {
        Positions {
            nodes,
            cursor: None,
        }
    }
}

impl<S: Coord, const D: usize> Iterator for Positions<S, D> {
    type Item = Point<S, D>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let found = match &mut self.cursor {
                Some(Cursor::Block(cells)) => cells.next(),
                Some(Cursor::Leaf { node, from }) => match node.bitmask() {
                    Some(mask) => mask.next_one(*from).map(|i| {
                        *from = i + 1;
                        let local = mask.specification().position(i);
                        let mut p = node.bounds.mins;
                        for d in 0..D {
                            p[d] = p[d] + S::cast(local[d]);
                        }
                        p
                    }),
                    None => None,
                },
                None => None,
            };
            if found.is_some() {
                return found;
            }
            let node = self.nodes.next()?;
            self.cursor = if node.value() == Some(true) {
                Some(Cursor::Block(node.bounds.cells()))
            } else if node.bitmask().is_some() {
                Some(Cursor::Leaf { node, from: 0 })
            } else {
                None
            };
        }
    }
}

#[test]
fn test_uniform_children() {
    let f = Arc::new(NodeData::<2>::Uniform(false));
    let t = Arc::new(NodeData::<2>::Uniform(true));
    let node = NodeData::split(&f);
    assert_eq!(node.children().map(|c| c.len()), Some(4));
    assert_eq!(node.uniform_children(), Some(false));
    let node = NodeData::embed(t.clone(), 2, &f);
    assert_eq!(node.uniform_children(), None);
    if let Some(children) = node.children() {
        assert_eq!(children[2].load().value(), Some(true));
        assert_eq!(children[1].load().value(), Some(false));
        for c in children {
            c.store(t.clone());
        }
    }
    assert_eq!(node.uniform_children(), Some(true));
    assert_eq!(t.uniform_children(), None);
}

#[test]
fn test_node_iter_prune() {
    use crate::bounds::point;

    let spec = Arc::new(Specification::new([8usize, 8]).unwrap());
    let f = Arc::new(NodeData::<2>::Uniform(false));
    let t = Arc::new(NodeData::<2>::Uniform(true));
    let inner = Arc::new(NodeData::embed(t, 3, &f));
    let root = Arc::new(NodeData::embed(inner, 0, &f));
    let bounds = Bounds::new(point([0i32, 0]), point([31, 31]));

    let all: Vec<_> = NodeIter::new(spec.clone(), Node::new(root.clone(), 2, bounds))
        .map(|n| (n.level(), n.bounds().mins[0], n.bounds().mins[1], n.bounds().maxs[0]))
        .collect();
    assert_eq!(all.len(), 1 + 4 + 4);
    assert_eq!(all[0], (2, 0, 0, 31));
    assert_eq!(all[1], (1, 0, 0, 15));
    assert_eq!(all[2], (0, 0, 0, 7));
    assert_eq!(all[5], (0, 8, 8, 15));
    assert_eq!(all[6], (1, 16, 0, 31));

    let mut iter = NodeIter::new(spec.clone(), Node::new(root.clone(), 2, bounds));
    let mut count = 0;
    while let Some(node) = iter.next() {
        count += 1;
        if node.level() == 1 {
            iter.prune();
        }
    }
    assert_eq!(count, 5);

    let cells: Vec<_> = Positions::new(NodeIter::new(spec, Node::new(root, 2, bounds))).collect();
    assert_eq!(cells.len(), 64);
    assert!(cells
        .iter()
        .all(|p| (8..16).contains(&p[0]) && (8..16).contains(&p[1])));
}
