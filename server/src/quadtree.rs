//! Arena allocated point quadtree used for the per-tick proximity queries.
//!
//! The tree is rebuilt from scratch every tick. All nodes live in fixed
//! capacity pools owned by the tree, so a rebuild never touches the global
//! allocator and [`QuadTree::reset`] is O(1). When a pool runs dry the tree
//! stops accepting inserts until the next reset and reports it through
//! [`QuadTree::limit_was_hit`]; queries keep working on what was inserted.
//!
//! Node variants:
//! - empty: a quadrant with nothing in it
//! - leaf: one value, plus a chain of values that could not be separated
//!   (identical positions or the depth cap was reached)
//! - inner: four children split at the square's midpoint, ties going to the
//!   lower quadrant

use log::error;
use serde::Serialize;
use shared::{Rect, Vec2};
use std::fmt;
use thiserror::Error;

pub const MAX_DEPTH: u32 = 16;

/// What the index stores: a position, a size hint and the entity id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IndexValue {
    pub position: Vec2,
    pub size: f32,
    pub id: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InsertError {
    #[error("position is not finite")]
    NotFinite,
    #[error("position lies outside the indexed square")]
    OutOfBounds,
    #[error("node pool exhausted")]
    PoolExhausted,
}

/// Pool sizes for a tree. Each variant has its own pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCapacities {
    pub empty: usize,
    pub leaf: usize,
    pub inner: usize,
    pub chained: usize,
}

impl Default for PoolCapacities {
    fn default() -> Self {
        Self {
            empty: 16384,
            leaf: 8192,
            inner: 4096,
            chained: 2048,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub empty: usize,
    pub leaf: usize,
    pub split: usize,
    pub inner: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolReport {
    pub name: &'static str,
    pub used: usize,
    pub capacity: usize,
    pub high_water: usize,
}

impl fmt::Display for PoolReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} (peak {})",
            self.name, self.used, self.capacity, self.high_water
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Square {
    origin: Vec2,
    size: f32,
}

impl Square {
    fn rect(&self) -> Rect {
        Rect::new(
            self.origin,
            Vec2::new(self.origin.x + self.size, self.origin.y + self.size),
        )
    }

    fn contains(&self, p: Vec2) -> bool {
        self.rect().contains(p)
    }

    fn quadrant_of(&self, p: Vec2) -> usize {
        let half = self.size / 2.0;
        let right = p.x > self.origin.x + half;
        let bottom = p.y > self.origin.y + half;
        (right as usize) | ((bottom as usize) << 1)
    }

    fn child(&self, quadrant: usize) -> Square {
        let half = self.size / 2.0;
        let dx = if quadrant & 1 == 1 { half } else { 0.0 };
        let dy = if quadrant & 2 == 2 { half } else { 0.0 };
        Square {
            origin: Vec2::new(self.origin.x + dx, self.origin.y + dy),
            size: half,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeRef {
    Empty(u32),
    Leaf(u32),
    Inner(u32),
}

#[derive(Debug, Clone, Copy)]
struct EmptyNode {
    square: Square,
}

#[derive(Debug, Clone, Copy)]
struct LeafNode {
    square: Square,
    value: IndexValue,
    next: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct ChainedNode {
    value: IndexValue,
    next: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct InnerNode {
    square: Square,
    children: [NodeRef; 4],
}

#[derive(Debug)]
struct Pool<T: Copy> {
    name: &'static str,
    slots: Vec<T>,
    capacity: usize,
    high_water: usize,
}

impl<T: Copy> Pool<T> {
    fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            slots: Vec::with_capacity(capacity),
            capacity,
            high_water: 0,
        }
    }

    fn alloc(&mut self, node: T) -> Option<u32> {
        if self.slots.len() >= self.capacity {
            return None;
        }
        self.slots.push(node);
        self.high_water = self.high_water.max(self.slots.len());
        Some((self.slots.len() - 1) as u32)
    }

    fn remaining(&self) -> usize {
        self.capacity - self.slots.len()
    }

    fn get(&self, index: u32) -> &T {
        &self.slots[index as usize]
    }

    fn get_mut(&mut self, index: u32) -> &mut T {
        &mut self.slots[index as usize]
    }

    // Nodes are Copy, so clearing only resets the length.
    fn reset(&mut self) {
        self.slots.clear();
    }

    fn report(&self) -> PoolReport {
        PoolReport {
            name: self.name,
            used: self.slots.len(),
            capacity: self.capacity,
            high_water: self.high_water,
        }
    }
}

/// Where a node reference lives, so it can be swapped in place.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Root,
    Child(u32, usize),
}

/// Caller owned result buffer. Stops collecting at its capacity and remembers
/// that it did.
#[derive(Debug, Clone)]
pub struct QueryBuffer {
    values: Vec<IndexValue>,
    capacity: usize,
    truncated: bool,
}

impl QueryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            capacity,
            truncated: false,
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.truncated = false;
    }

    fn push(&mut self, value: IndexValue) {
        if self.values.len() >= self.capacity {
            self.truncated = true;
        } else {
            self.values.push(value);
        }
    }

    pub fn values(&self) -> &[IndexValue] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexValue> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

pub struct QuadTree {
    bounds: Square,
    root: NodeRef,
    empties: Pool<EmptyNode>,
    leaves: Pool<LeafNode>,
    inners: Pool<InnerNode>,
    chained: Pool<ChainedNode>,
    limit_was_hit: bool,
    len: usize,
}

impl QuadTree {
    /// Creates a tree over the square `[0, size] x [0, size]`.
    pub fn new(size: f32, capacities: PoolCapacities) -> Self {
        let mut tree = Self {
            bounds: Square {
                origin: Vec2::ZERO,
                size,
            },
            root: NodeRef::Empty(0),
            empties: Pool::new("empty", capacities.empty.max(1)),
            leaves: Pool::new("leaf", capacities.leaf),
            inners: Pool::new("inner", capacities.inner),
            chained: Pool::new("chained", capacities.chained),
            limit_was_hit: false,
            len: 0,
        };
        tree.reset();
        tree
    }

    /// Drops every node. Pool memory is kept for the next build.
    pub fn reset(&mut self) {
        self.empties.reset();
        self.leaves.reset();
        self.inners.reset();
        self.chained.reset();
        self.limit_was_hit = false;
        self.len = 0;
        let square = self.bounds;
        // Capacity is at least one and the pool was just cleared.
        let root = self.empties.alloc(EmptyNode { square }).unwrap_or(0);
        self.root = NodeRef::Empty(root);
    }

    pub fn limit_was_hit(&self) -> bool {
        self.limit_was_hit
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, position: Vec2, size: f32, id: u64) -> Result<(), InsertError> {
        if self.limit_was_hit {
            return Err(InsertError::PoolExhausted);
        }
        if !position.is_finite() {
            return Err(InsertError::NotFinite);
        }
        if !self.bounds.contains(position) {
            return Err(InsertError::OutOfBounds);
        }

        let value = IndexValue { position, size, id };
        let mut slot = Slot::Root;
        let mut depth = 0;

        loop {
            match self.node_at(slot) {
                NodeRef::Empty(index) => {
                    let square = self.empties.get(index).square;
                    let leaf = self.alloc_leaf(LeafNode {
                        square,
                        value,
                        next: None,
                    })?;
                    self.set_node(slot, NodeRef::Leaf(leaf));
                    self.len += 1;
                    return Ok(());
                }
                NodeRef::Inner(index) => {
                    let quadrant = self.inners.get(index).square.quadrant_of(position);
                    slot = Slot::Child(index, quadrant);
                    depth += 1;
                }
                NodeRef::Leaf(index) => {
                    let existing = *self.leaves.get(index);
                    if existing.value.position == position || depth >= MAX_DEPTH {
                        let link = self.alloc_chained(ChainedNode {
                            value,
                            next: existing.next,
                        })?;
                        self.leaves.get_mut(index).next = Some(link);
                        self.len += 1;
                        return Ok(());
                    }

                    let inner = self.split_leaf(index, existing)?;
                    self.set_node(slot, NodeRef::Inner(inner));
                }
            }
        }
    }

    /// Turns a leaf into an inner node, moving the leaf one level down.
    fn split_leaf(&mut self, leaf_index: u32, leaf: LeafNode) -> Result<u32, InsertError> {
        if self.inners.remaining() < 1 || self.empties.remaining() < 3 {
            self.mark_exhausted();
            return Err(InsertError::PoolExhausted);
        }

        let square = leaf.square;
        let leaf_quadrant = square.quadrant_of(leaf.value.position);
        let mut children = [NodeRef::Empty(0); 4];
        for (quadrant, child) in children.iter_mut().enumerate() {
            let child_square = square.child(quadrant);
            if quadrant == leaf_quadrant {
                self.leaves.get_mut(leaf_index).square = child_square;
                *child = NodeRef::Leaf(leaf_index);
            } else {
                let empty = self
                    .empties
                    .alloc(EmptyNode {
                        square: child_square,
                    })
                    .ok_or(InsertError::PoolExhausted)?;
                *child = NodeRef::Empty(empty);
            }
        }

        self.inners
            .alloc(InnerNode { square, children })
            .ok_or(InsertError::PoolExhausted)
    }

    fn alloc_leaf(&mut self, node: LeafNode) -> Result<u32, InsertError> {
        match self.leaves.alloc(node) {
            Some(index) => Ok(index),
            None => {
                self.mark_exhausted();
                Err(InsertError::PoolExhausted)
            }
        }
    }

    fn alloc_chained(&mut self, node: ChainedNode) -> Result<u32, InsertError> {
        match self.chained.alloc(node) {
            Some(index) => Ok(index),
            None => {
                self.mark_exhausted();
                Err(InsertError::PoolExhausted)
            }
        }
    }

    fn mark_exhausted(&mut self) {
        if !self.limit_was_hit {
            self.limit_was_hit = true;
            let report = self.report();
            error!(
                "Quadtree node limit hit after {} values: {}, {}, {}, {}",
                self.len, report[0], report[1], report[2], report[3]
            );
        }
    }

    fn node_at(&self, slot: Slot) -> NodeRef {
        match slot {
            Slot::Root => self.root,
            Slot::Child(inner, quadrant) => self.inners.get(inner).children[quadrant],
        }
    }

    fn set_node(&mut self, slot: Slot, node: NodeRef) {
        match slot {
            Slot::Root => self.root = node,
            Slot::Child(inner, quadrant) => self.inners.get_mut(inner).children[quadrant] = node,
        }
    }

    /// Collects every value whose position lies inside `rect` (inclusive).
    pub fn query(&self, rect: &Rect, out: &mut QueryBuffer) {
        self.visit(self.root, rect, out);
    }

    fn visit(&self, node: NodeRef, rect: &Rect, out: &mut QueryBuffer) {
        match node {
            NodeRef::Empty(_) => {}
            NodeRef::Leaf(index) => {
                let leaf = self.leaves.get(index);
                if rect.contains(leaf.value.position) {
                    out.push(leaf.value);
                }
                let mut next = leaf.next;
                while let Some(link) = next {
                    let chained = self.chained.get(link);
                    if rect.contains(chained.value.position) {
                        out.push(chained.value);
                    }
                    next = chained.next;
                }
            }
            NodeRef::Inner(index) => {
                let inner = self.inners.get(index);
                if !inner.square.rect().intersects(rect) {
                    return;
                }
                for child in inner.children {
                    self.visit(child, rect, out);
                }
            }
        }
    }

    /// Node counts reachable from the root. `split` counts chained values.
    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats::default();
        self.count(self.root, &mut stats);
        stats
    }

    fn count(&self, node: NodeRef, stats: &mut TreeStats) {
        match node {
            NodeRef::Empty(_) => stats.empty += 1,
            NodeRef::Leaf(index) => {
                stats.leaf += 1;
                let mut next = self.leaves.get(index).next;
                while let Some(link) = next {
                    stats.split += 1;
                    next = self.chained.get(link).next;
                }
            }
            NodeRef::Inner(index) => {
                stats.inner += 1;
                for child in self.inners.get(index).children {
                    self.count(child, stats);
                }
            }
        }
    }

    pub fn report(&self) -> [PoolReport; 4] {
        [
            self.empties.report(),
            self.leaves.report(),
            self.inners.report(),
            self.chained.report(),
        ]
    }

    /// Every stored value, for postmortem logging.
    pub fn values(&self) -> Vec<IndexValue> {
        let mut out = QueryBuffer::new(self.len);
        self.visit(self.root, &self.bounds.rect(), &mut out);
        out.values
    }

    pub fn dump_json(&self) -> String {
        serde_json::to_string(&self.values()).unwrap_or_else(|e| format!("<dump failed: {}>", e))
    }
}
