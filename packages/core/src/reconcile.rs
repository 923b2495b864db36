//! Child-list reconciliation: the sequential three-way splice.
//!
//! `reconcile` diffs a synchronized `current` child list against a target
//! `next` list and issues the minimum viable sequence of parent-child
//! mutations against an abstract node sink. The classical approach computes a
//! longest increasing subsequence over matched indices and moves everything
//! off it; this algorithm instead works both lists inward from the edges,
//! splicing runs as it finds them, and on common shapes issues strictly fewer
//! operations (replaces count one operation where a remove + insert pair
//! would count two).
//!
//! The master invariant: `current` mirrors the parent's live children after
//! every single sink call. Every branch performs its sink mutation and the
//! matching vector splice together, so whatever path the cursors take, the
//! tree and the mirror cannot drift apart. Termination is by cursor progress:
//! each iteration advances `start`, contracts an end, or removes an element.
//!
//! Node handles are compared by identity (`Eq` on the handle, not on any
//! rendered content) and `current`/`next` must be duplicate-free, which the
//! tree sink requires anyway.

use std::hash::Hash;

use rustc_hash::{FxHashMap, FxHashSet};

/// What the reconciler assumes about the tree it drives.
///
/// `insert_before` with a `None` reference appends. An insert of a node that
/// is already attached is a move, as in the DOM.
pub trait WriteNodes {
    type Node: Clone + Eq + Hash;

    fn insert_before(
        &mut self,
        parent: &Self::Node,
        child: &Self::Node,
        reference: Option<&Self::Node>,
    );

    fn remove_child(&mut self, parent: &Self::Node, child: &Self::Node);

    fn replace_child(&mut self, parent: &Self::Node, new: &Self::Node, old: &Self::Node);

    fn next_sibling(&self, node: &Self::Node) -> Option<Self::Node>;
}

/// Mutate `parent`'s children (mirrored by `current`) until they equal
/// `next`, element for element. On return `current == next`.
pub fn reconcile<S: WriteNodes>(
    sink: &mut S,
    parent: &S::Node,
    current: &mut Vec<S::Node>,
    next: &[S::Node],
) {
    #[cfg(debug_assertions)]
    {
        let unique: FxHashSet<&S::Node> = current.iter().collect();
        debug_assert_eq!(unique.len(), current.len(), "current contains duplicate nodes");
        let unique: FxHashSet<&S::Node> = next.iter().collect();
        debug_assert_eq!(unique.len(), next.len(), "next contains duplicate nodes");
    }

    let mut splicer = Splicer {
        sink,
        parent,
        current,
        next,
        start: 0,
        c_end: 0,
        n_end: next.len(),
        next_index: None,
        current_set: None,
    };
    splicer.c_end = splicer.current.len();
    splicer.run();

    debug_assert!(current.as_slice() == next, "mirror does not match the target");
}

struct Splicer<'a, S: WriteNodes> {
    sink: &'a mut S,
    parent: &'a S::Node,
    current: &'a mut Vec<S::Node>,
    next: &'a [S::Node],
    start: usize,
    c_end: usize,
    n_end: usize,
    /// node -> absolute index in `next`; built on entering advanced mode.
    next_index: Option<FxHashMap<S::Node, usize>>,
    /// live membership of the active `current` window.
    current_set: Option<FxHashSet<S::Node>>,
}

impl<'a, S: WriteNodes> Splicer<'a, S> {
    /// First settled node after the active window, the reference for
    /// tail-area insertions. Everything past `n_end` already matches `next`.
    fn after_ref(&self) -> Option<S::Node> {
        if self.n_end < self.next.len() {
            Some(self.next[self.n_end].clone())
        } else {
            None
        }
    }

    fn in_next(&self, node: &S::Node) -> Option<usize> {
        self.next_index
            .as_ref()
            .and_then(|map| map.get(node).copied())
            .filter(|&index| index >= self.start && index < self.n_end)
    }

    fn in_current(&self, node: &S::Node) -> bool {
        self.current_set
            .as_ref()
            .map(|set| set.contains(node))
            .unwrap_or(false)
    }

    fn set_remove(&mut self, node: &S::Node) {
        if let Some(set) = self.current_set.as_mut() {
            set.remove(node);
        }
    }

    fn advance_start(&mut self) {
        let node = self.current[self.start].clone();
        self.set_remove(&node);
        self.start += 1;
    }

    fn retract_c_end(&mut self) {
        self.c_end -= 1;
        let node = self.current[self.c_end].clone();
        self.set_remove(&node);
    }

    fn build_structures(&mut self) {
        let mut map = FxHashMap::default();
        for j in self.start..self.n_end {
            map.insert(self.next[j].clone(), j);
        }
        let mut set = FxHashSet::default();
        for i in self.start..self.c_end {
            set.insert(self.current[i].clone());
        }
        self.next_index = Some(map);
        self.current_set = Some(set);
    }

    fn run(&mut self) {
        while self.start < self.c_end && self.start < self.n_end {
            // shared check 1: matching prefix
            if self.current[self.start] == self.next[self.start] {
                self.advance_start();
                continue;
            }
            // shared check 2: matching suffix
            if self.current[self.c_end - 1] == self.next[self.n_end - 1] {
                self.retract_c_end();
                self.n_end -= 1;
                continue;
            }
            // shared check 3: fully crossed ends swap in place
            if self.current[self.start] == self.next[self.n_end - 1]
                && self.current[self.c_end - 1] == self.next[self.start]
            {
                self.cross_swap();
                continue;
            }

            if self.next_index.is_none() {
                if self.initial_mode_step() {
                    continue;
                }
                // nothing cheap left; pay for the index structures
                self.build_structures();
                continue;
            }

            // advanced mode tail passes
            let current_tail_in_next = self.in_next(&self.current[self.c_end - 1]).is_some();
            let next_tail_in_current = self.in_current(&self.next[self.n_end - 1]);
            if !current_tail_in_next && !next_tail_in_current {
                // replace-run: both tails are strangers to the other side
                let old = self.current[self.c_end - 1].clone();
                let new = self.next[self.n_end - 1].clone();
                self.sink.replace_child(self.parent, &new, &old);
                self.set_remove(&old);
                self.current[self.c_end - 1] = new;
                self.c_end -= 1;
                self.n_end -= 1;
                continue;
            }
            if !next_tail_in_current {
                // insert-run: the next tail is new material
                let node = self.next[self.n_end - 1].clone();
                let reference = self.after_ref();
                self.sink.insert_before(self.parent, &node, reference.as_ref());
                self.current.insert(self.c_end, node);
                self.n_end -= 1;
                continue;
            }
            if !current_tail_in_next {
                // remove-run: the current tail has no future
                let node = self.current[self.c_end - 1].clone();
                self.sink.remove_child(self.parent, &node);
                self.set_remove(&node);
                self.current.remove(self.c_end - 1);
                self.c_end -= 1;
                continue;
            }

            self.rearrange();
        }

        // tail pass
        if self.start == self.c_end && self.start < self.n_end {
            let reference = self.after_ref();
            for j in self.start..self.n_end {
                self.sink
                    .insert_before(self.parent, &self.next[j], reference.as_ref());
                self.current.insert(j, self.next[j].clone());
            }
        } else if self.start == self.n_end && self.start < self.c_end {
            for _ in self.start..self.c_end {
                let victim = self.current[self.start].clone();
                self.sink.remove_child(self.parent, &victim);
                self.current.remove(self.start);
            }
        }
    }

    /// Both ends belong at each other's positions: two moves, one elided when
    /// the pair is adjacent.
    fn cross_swap(&mut self) {
        let front = self.current[self.start].clone();
        let back = self.current[self.c_end - 1].clone();
        let after = self.sink.next_sibling(&back);
        self.sink.insert_before(self.parent, &back, Some(&front));
        if self.c_end - self.start > 2 {
            self.sink.insert_before(self.parent, &front, after.as_ref());
        }
        // mirror the two moves
        self.current.remove(self.c_end - 1);
        self.current.insert(self.start, back);
        self.current.remove(self.start + 1);
        self.current.insert(self.c_end - 1, front);

        self.advance_start();
        self.retract_c_end();
        self.n_end -= 1;
    }

    /// Cheap opportunistic paths available before the index structures exist.
    /// Returns true if it consumed anything.
    fn initial_mode_step(&mut self) -> bool {
        // right-to-left single move: the current tail belongs at the head
        if self.next[self.start] == self.current[self.c_end - 1] {
            let node = self.current[self.c_end - 1].clone();
            self.sink
                .insert_before(self.parent, &node, Some(&self.current[self.start]));
            self.current.remove(self.c_end - 1);
            self.current.insert(self.start, node);
            self.advance_start();
            return true;
        }
        // left-to-right single move: the current head belongs at the tail
        if self.current[self.start] == self.next[self.n_end - 1] {
            let node = self.current[self.start].clone();
            let reference = self.after_ref();
            self.sink.insert_before(self.parent, &node, reference.as_ref());
            self.current.remove(self.start);
            self.current.insert(self.c_end - 1, node);
            self.c_end -= 1;
            self.n_end -= 1;
            return true;
        }
        if self.contiguous_fast_path() {
            return true;
        }
        self.one_remaining_fast_path()
    }

    /// If one side's remaining run is a contiguous subrange of the other,
    /// only the differing prefix/suffix needs inserts or removes.
    fn contiguous_fast_path(&mut self) -> bool {
        let c_len = self.c_end - self.start;
        let n_len = self.n_end - self.start;

        if c_len < n_len {
            // is current[start..c_end] contiguous inside next[start..n_end]?
            let probe = &self.current[self.start];
            let Some(j) = (self.start..self.n_end).find(|&j| &self.next[j] == probe) else {
                return false;
            };
            if j + c_len > self.n_end
                || self.next[j..j + c_len] != self.current[self.start..self.c_end]
            {
                return false;
            }
            // prefix inserts before the surviving run
            let head = self.current[self.start].clone();
            for (offset, t) in (self.start..j).enumerate() {
                self.sink
                    .insert_before(self.parent, &self.next[t], Some(&head));
                self.current.insert(self.start + offset, self.next[t].clone());
            }
            // suffix inserts against the settled tail
            let reference = self.after_ref();
            for t in j + c_len..self.n_end {
                self.sink
                    .insert_before(self.parent, &self.next[t], reference.as_ref());
                self.current.insert(t, self.next[t].clone());
            }
            self.start = self.n_end;
            self.c_end = self.n_end;
            return true;
        }

        if n_len < c_len {
            // is next[start..n_end] contiguous inside current[start..c_end]?
            let probe = &self.next[self.start];
            let Some(j) = (self.start..self.c_end).find(|&j| &self.current[j] == probe) else {
                return false;
            };
            if j + n_len > self.c_end
                || self.current[j..j + n_len] != self.next[self.start..self.n_end]
            {
                return false;
            }
            // shed the suffix first so head indices stay valid
            for t in (j + n_len..self.c_end).rev() {
                let victim = self.current[t].clone();
                self.sink.remove_child(self.parent, &victim);
                self.current.remove(t);
            }
            for t in (self.start..j).rev() {
                let victim = self.current[t].clone();
                self.sink.remove_child(self.parent, &victim);
                self.current.remove(t);
            }
            self.c_end = self.n_end;
            self.start = self.n_end;
            return true;
        }

        false
    }

    /// Replace-one-with-many / many-with-one as a batch.
    fn one_remaining_fast_path(&mut self) -> bool {
        let c_len = self.c_end - self.start;
        let n_len = self.n_end - self.start;

        if c_len == 1 {
            let old = self.current[self.start].clone();
            for t in self.start..self.n_end - 1 {
                self.sink.insert_before(self.parent, &self.next[t], Some(&old));
                self.current.insert(t, self.next[t].clone());
            }
            let last = self.next[self.n_end - 1].clone();
            self.sink.replace_child(self.parent, &last, &old);
            self.current[self.n_end - 1] = last;
            self.start = self.n_end;
            self.c_end = self.n_end;
            return true;
        }

        if n_len == 1 {
            let new = self.next[self.start].clone();
            let old = self.current[self.start].clone();
            self.sink.replace_child(self.parent, &new, &old);
            self.current[self.start] = new;
            for t in (self.start + 1..self.c_end).rev() {
                let victim = self.current[t].clone();
                self.sink.remove_child(self.parent, &victim);
                self.current.remove(t);
            }
            self.c_end = self.start + 1;
            self.start = self.c_end;
            self.n_end = self.c_end;
            return true;
        }

        false
    }

    /// The advanced-mode core: place the run at `next[start..]`, then deal
    /// with the displaced run at `current[start..]`.
    fn rearrange(&mut self) {
        let c_n = self.current[self.start].clone();
        let n_n = self.next[self.start].clone();
        debug_assert!(c_n != n_n);

        // --- analyze the next-side run
        let mut i_found: Option<usize> = None;
        let mut seq: usize = 1;
        if self.in_current(&n_n) {
            let mut i = self.start + 1;
            while i < self.c_end && self.current[i] != n_n {
                i += 1;
            }
            debug_assert!(i < self.c_end, "membership set out of sync");
            i_found = Some(i);
            while i + seq < self.c_end
                && self.start + seq < self.n_end
                && self.current[i + seq] == self.next[self.start + seq]
            {
                seq += 1;
            }
        } else {
            while self.start + seq < self.n_end && !self.in_current(&self.next[self.start + seq]) {
                seq += 1;
            }
        }

        // --- decide whether the current side needs symmetric work
        let moving = i_found.is_some();
        let skip_cur = (self.start + seq < self.n_end && self.next[self.start + seq] == c_n)
            || (moving && seq > i_found.expect("moving") - self.start);
        let mut k_found: Option<usize> = None;
        let mut c_seq: usize = 1;
        if !skip_cur {
            k_found = self.in_next(&c_n);
            if let Some(k) = k_found {
                while k + c_seq < self.n_end
                    && self.start + c_seq < self.c_end
                    && self.next[k + c_seq] == self.current[self.start + c_seq]
                {
                    c_seq += 1;
                }
            } else {
                while self.start + c_seq < self.c_end
                    && self.in_next(&self.current[self.start + c_seq]).is_none()
                {
                    c_seq += 1;
                }
            }
        }

        // --- right-to-left phase: the next run lands at `start`
        if let Some(i) = i_found {
            if seq == 1 && !skip_cur && c_seq == 1 && k_found.is_some() {
                // two single nodes trading places: inner swap, second move
                // elided when they are adjacent
                let after_i = self.sink.next_sibling(&self.current[i]);
                self.sink.insert_before(self.parent, &n_n, Some(&c_n));
                if i != self.start + 1 {
                    self.sink.insert_before(self.parent, &c_n, after_i.as_ref());
                }
                self.current.swap(self.start, i);
                self.advance_start();
                return;
            }

            let dist = i - self.start;
            if seq > dist {
                // fewer ops to push the intervening nodes behind the run
                let after_run = self.sink.next_sibling(&self.current[i + seq - 1]);
                for t in 0..dist {
                    self.sink.insert_before(
                        self.parent,
                        &self.current[self.start + t],
                        after_run.as_ref(),
                    );
                }
                self.current[self.start..i + seq].rotate_left(dist);
            } else {
                for t in 0..seq {
                    self.sink
                        .insert_before(self.parent, &self.current[i + t], Some(&c_n));
                }
                self.current[self.start..i + seq].rotate_right(seq);
            }
            for _ in 0..seq {
                self.advance_start();
            }
        } else if !skip_cur && k_found.is_none() {
            // both sides hold runs the other has no use for: pair them up as
            // replaces, then settle the length difference
            let m = seq.min(c_seq);
            for t in 0..m {
                let old = self.current[self.start + t].clone();
                let new = self.next[self.start + t].clone();
                self.sink.replace_child(self.parent, &new, &old);
                self.set_remove(&old);
                self.current[self.start + t] = new;
            }
            if seq > m {
                let reference: Option<S::Node> = if self.start + m < self.c_end {
                    Some(self.current[self.start + m].clone())
                } else {
                    self.after_ref()
                };
                for t in m..seq {
                    self.sink
                        .insert_before(self.parent, &self.next[self.start + t], reference.as_ref());
                    self.current
                        .insert(self.start + t, self.next[self.start + t].clone());
                    self.c_end += 1;
                }
            } else if c_seq > m {
                for _ in m..c_seq {
                    let victim = self.current[self.start + m].clone();
                    self.sink.remove_child(self.parent, &victim);
                    self.set_remove(&victim);
                    self.current.remove(self.start + m);
                    self.c_end -= 1;
                }
            }
            for _ in 0..seq {
                self.advance_start();
            }
            return; // symmetric work fully handled
        } else {
            // brand-new run enters before the displaced head
            for t in 0..seq {
                self.sink
                    .insert_before(self.parent, &self.next[self.start + t], Some(&c_n));
                self.current
                    .insert(self.start + t, self.next[self.start + t].clone());
                self.c_end += 1;
            }
            for _ in 0..seq {
                self.advance_start();
            }
        }

        // --- left-to-right phase: place the displaced current run
        if skip_cur {
            return;
        }
        debug_assert!(self.current[self.start] == c_n);

        match k_found {
            None => {
                // the run leaves the tree
                for _ in 0..c_seq {
                    let victim = self.current[self.start].clone();
                    self.sink.remove_child(self.parent, &victim);
                    self.set_remove(&victim);
                    self.current.remove(self.start);
                    self.c_end -= 1;
                }
            }
            Some(k) if k + c_seq >= self.n_end => {
                // the run belongs flush against the settled suffix
                debug_assert_eq!(k + c_seq, self.n_end);
                let reference = self.after_ref();
                for t in 0..c_seq {
                    self.sink.insert_before(
                        self.parent,
                        &self.current[self.start + t],
                        reference.as_ref(),
                    );
                }
                let run: Vec<S::Node> = self
                    .current
                    .drain(self.start..self.start + c_seq)
                    .collect();
                self.c_end -= c_seq;
                for (offset, node) in run.into_iter().enumerate() {
                    self.set_remove(&node);
                    self.current.insert(self.c_end + offset, node);
                }
                self.n_end = k;
            }
            Some(k) => {
                // interior destination: only worth a move if the run's right
                // neighbour is already live; otherwise later iterations place
                // it once the neighbourhood exists
                let neighbour = self.next[k + c_seq].clone();
                if self.in_current(&neighbour) {
                    let mut anchor = self.start + c_seq;
                    while anchor < self.c_end && self.current[anchor] != neighbour {
                        anchor += 1;
                    }
                    debug_assert!(anchor < self.c_end, "membership set out of sync");
                    let dist = anchor - (self.start + c_seq);
                    if c_seq > dist {
                        for t in 0..dist {
                            self.sink.insert_before(
                                self.parent,
                                &self.current[self.start + c_seq + t],
                                Some(&c_n),
                            );
                        }
                    } else {
                        for t in 0..c_seq {
                            self.sink.insert_before(
                                self.parent,
                                &self.current[self.start + t],
                                Some(&neighbour),
                            );
                        }
                    }
                    self.current[self.start..anchor].rotate_left(c_seq);
                }
            }
        }
    }
}

// --- op recording ---------------------------------------------------------

/// A single mutation issued against the node sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOp<N> {
    InsertBefore { child: N, reference: Option<N> },
    RemoveChild { child: N },
    ReplaceChild { new: N, old: N },
}

/// Wraps a sink and records every mutation flowing through it. Tests assert
/// operation counts with it; embedders can ship the log over a wire.
pub struct Recorder<S: WriteNodes> {
    pub sink: S,
    pub ops: Vec<NodeOp<S::Node>>,
}

impl<S: WriteNodes> Recorder<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            ops: Vec::new(),
        }
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

impl<S: WriteNodes> WriteNodes for Recorder<S> {
    type Node = S::Node;

    fn insert_before(
        &mut self,
        parent: &Self::Node,
        child: &Self::Node,
        reference: Option<&Self::Node>,
    ) {
        self.ops.push(NodeOp::InsertBefore {
            child: child.clone(),
            reference: reference.cloned(),
        });
        self.sink.insert_before(parent, child, reference);
    }

    fn remove_child(&mut self, parent: &Self::Node, child: &Self::Node) {
        self.ops.push(NodeOp::RemoveChild {
            child: child.clone(),
        });
        self.sink.remove_child(parent, child);
    }

    fn replace_child(&mut self, parent: &Self::Node, new: &Self::Node, old: &Self::Node) {
        self.ops.push(NodeOp::ReplaceChild {
            new: new.clone(),
            old: old.clone(),
        });
        self.sink.replace_child(parent, new, old);
    }

    fn next_sibling(&self, node: &Self::Node) -> Option<Self::Node> {
        self.sink.next_sibling(node)
    }
}

// --- reference sink -------------------------------------------------------

/// In-memory tree over integer node ids, the reference implementation of
/// [`WriteNodes`]. Inserting an attached node moves it, as in the DOM.
#[derive(Default)]
pub struct VecTree {
    children: FxHashMap<usize, Vec<usize>>,
    parent_of: FxHashMap<usize, usize>,
}

impl VecTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `parent` with `nodes`, detaching whatever was there.
    pub fn set_children(&mut self, parent: usize, nodes: &[usize]) {
        if let Some(old) = self.children.insert(parent, nodes.to_vec()) {
            for node in old {
                self.parent_of.remove(&node);
            }
        }
        for &node in nodes {
            self.parent_of.insert(node, parent);
        }
    }

    pub fn children(&self, parent: usize) -> &[usize] {
        self.children.get(&parent).map(Vec::as_slice).unwrap_or(&[])
    }

    fn detach(&mut self, node: usize) {
        if let Some(parent) = self.parent_of.remove(&node) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|&n| n != node);
            }
        }
    }
}

impl WriteNodes for VecTree {
    type Node = usize;

    fn insert_before(&mut self, parent: &usize, child: &usize, reference: Option<&usize>) {
        self.detach(*child);
        let siblings = self.children.entry(*parent).or_default();
        match reference {
            Some(reference) => {
                let at = siblings
                    .iter()
                    .position(|n| n == reference)
                    .expect("reference node is not a child of parent");
                siblings.insert(at, *child);
            }
            None => siblings.push(*child),
        }
        self.parent_of.insert(*child, *parent);
    }

    fn remove_child(&mut self, parent: &usize, child: &usize) {
        debug_assert_eq!(self.parent_of.get(child), Some(parent));
        self.detach(*child);
    }

    fn replace_child(&mut self, parent: &usize, new: &usize, old: &usize) {
        self.detach(*new);
        let siblings = self
            .children
            .get_mut(parent)
            .expect("replace in a parent with no children");
        let at = siblings
            .iter()
            .position(|n| n == old)
            .expect("old node is not a child of parent");
        siblings[at] = *new;
        self.parent_of.remove(old);
        self.parent_of.insert(*new, *parent);
    }

    fn next_sibling(&self, node: &usize) -> Option<usize> {
        let parent = self.parent_of.get(node)?;
        let siblings = self.children.get(parent)?;
        let at = siblings.iter().position(|n| n == node)?;
        siblings.get(at + 1).copied()
    }
}
