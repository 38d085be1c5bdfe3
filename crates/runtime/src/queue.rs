//! Priority queue
//!
//! Five buckets scanned in class order. `Child`, `Pure` and `Effect` are
//! FIFO lists with no within-class ordering beyond insertion. `Barrier`
//! and `Sampler` layers share one skew heap because their relative order
//! is user-visible: barriers fire before samplers, and within each class
//! older ids fire before newer ones. The two shared buckets track only
//! their sizes.

use std::collections::VecDeque;

use crate::stack::FrameId;
use crate::types::Priority;

/// One queue entry: where in a node's sequence execution resumes, with
/// which frame and at which priority
#[derive(Debug, Clone, Copy)]
pub(crate) struct Layer {
    /// Instruction cursor into the node's sequence
    pub idx: usize,
    /// Stack frame the node executes against
    pub frame: FrameId,
    /// Class this entry was queued at
    pub priority: Priority,
    /// Heap ordering key; the barrier id for heap-ordered layers
    pub id: u64,
}

struct HeapNode {
    layer: Layer,
    left: Option<Box<HeapNode>>,
    right: Option<Box<HeapNode>>,
}

impl HeapNode {
    fn singleton(layer: Layer) -> Option<Box<HeapNode>> {
        Some(Box::new(HeapNode {
            layer,
            left: None,
            right: None,
        }))
    }

    /// Two-key min comparison: same class orders by id, otherwise
    /// `Barrier` precedes `Sampler`.
    fn wins_over(&self, other: &HeapNode) -> bool {
        if self.layer.priority == other.layer.priority {
            self.layer.id <= other.layer.id
        } else {
            self.layer.priority < other.layer.priority
        }
    }
}

/// Skew-heap meld, min-first.
fn meld(a: Option<Box<HeapNode>>, b: Option<Box<HeapNode>>) -> Option<Box<HeapNode>> {
    let Some(mut a) = a else { return b };
    let Some(mut b) = b else { return Some(a) };
    if !a.wins_over(&b) {
        std::mem::swap(&mut a, &mut b);
    }
    let right = a.right.take();
    a.right = meld(right, Some(b));
    std::mem::swap(&mut a.left, &mut a.right);
    Some(a)
}

#[derive(Default)]
struct Bucket {
    size: usize,
    /// Layers for FIFO classes; stays empty for heap-ordered classes
    layers: VecDeque<Layer>,
}

/// The composite queue
pub(crate) struct Queue {
    buckets: [Bucket; 5],
    /// Shared heap for `Barrier` and `Sampler` layers
    heap: Option<Box<HeapNode>>,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Bucket::default()),
            heap: None,
        }
    }
}

impl Queue {
    pub fn enqueue(&mut self, layer: Layer) {
        let bucket = &mut self.buckets[layer.priority as usize];
        bucket.size += 1;
        if layer.priority.heap_ordered() {
            self.heap = meld(self.heap.take(), HeapNode::singleton(layer));
        } else {
            bucket.layers.push_back(layer);
        }
    }

    /// Pop the highest-priority layer: first non-empty bucket in class
    /// order, then FIFO head or heap root. The heap root is always in
    /// the first non-empty shared class because barriers win the meld.
    pub fn dequeue(&mut self) -> Option<Layer> {
        for priority in Priority::ALL {
            if self.buckets[priority as usize].size == 0 {
                continue;
            }
            let layer = if priority.heap_ordered() {
                let root = self.heap.take().unwrap();
                self.heap = meld(root.left, root.right);
                root.layer
            } else {
                self.buckets[priority as usize].layers.pop_front().unwrap()
            };
            self.buckets[layer.priority as usize].size -= 1;
            return Some(layer);
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.size == 0)
    }

    #[cfg(test)]
    fn size_of(&self, priority: Priority) -> usize {
        self.buckets[priority as usize].size
    }
}
