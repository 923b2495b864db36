//! Splice reconciler: correctness over arbitrary lists, op counts on the
//! shapes the algorithm is built to win.

use filament_core::{reconcile, NodeOp, Recorder, VecTree};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const PARENT: usize = 0;

fn setup(children: &[usize]) -> (Recorder<VecTree>, Vec<usize>) {
    let mut tree = VecTree::new();
    tree.set_children(PARENT, children);
    (Recorder::new(tree), children.to_vec())
}

fn run(current: &[usize], next: &[usize]) -> (Recorder<VecTree>, Vec<usize>) {
    let (mut sink, mut mirror) = setup(current);
    reconcile(&mut sink, &PARENT, &mut mirror, next);
    assert_eq!(sink.sink.children(PARENT), next, "tree must equal the target");
    assert_eq!(mirror, next, "mirror must equal the target");
    (sink, mirror)
}

#[test]
fn small_reorder_takes_three_operations() {
    // one move of c, one replace d -> h, one move of f
    let (sink, _) = run(&[1, 2, 3, 4, 5, 6], &[1, 3, 2, 8, 6, 5]);
    assert_eq!(sink.op_count(), 3);
    assert!(sink
        .ops
        .iter()
        .any(|op| matches!(op, NodeOp::ReplaceChild { new: 8, old: 4 })));
}

#[test]
fn suffix_insert_takes_two_appends() {
    let (sink, _) = run(&[1, 2, 3], &[1, 2, 3, 4, 5]);
    assert_eq!(sink.op_count(), 2);
    assert_eq!(
        sink.ops,
        vec![
            NodeOp::InsertBefore {
                child: 4,
                reference: None
            },
            NodeOp::InsertBefore {
                child: 5,
                reference: None
            },
        ]
    );
}

#[test]
fn full_reverse_stays_within_four_operations() {
    let (sink, _) = run(&[1, 2, 3, 4], &[4, 3, 2, 1]);
    assert!(
        sink.op_count() <= 4,
        "reverse took {} operations",
        sink.op_count()
    );
}

#[test]
fn prefix_insert_only_inserts() {
    let (sink, _) = run(&[3, 4], &[1, 2, 3, 4, 5]);
    assert_eq!(sink.op_count(), 3);
    assert!(sink
        .ops
        .iter()
        .all(|op| matches!(op, NodeOp::InsertBefore { .. })));
}

#[test]
fn contiguous_shrink_only_removes() {
    let (sink, _) = run(&[1, 2, 3, 4, 5], &[2, 3, 4]);
    assert_eq!(sink.op_count(), 2);
    assert!(sink
        .ops
        .iter()
        .all(|op| matches!(op, NodeOp::RemoveChild { .. })));
}

#[test]
fn one_replaced_by_many_batches() {
    // two inserts plus one replace, instead of three inserts and a remove
    let (sink, _) = run(&[1], &[7, 8, 9]);
    assert_eq!(sink.op_count(), 3);
    assert_eq!(
        sink.ops
            .iter()
            .filter(|op| matches!(op, NodeOp::ReplaceChild { .. }))
            .count(),
        1
    );
}

#[test]
fn many_replaced_by_one_batches() {
    let (sink, _) = run(&[1, 2, 3], &[7]);
    assert_eq!(sink.op_count(), 3);
    assert_eq!(
        sink.ops
            .iter()
            .filter(|op| matches!(op, NodeOp::ReplaceChild { .. }))
            .count(),
        1
    );
}

#[test]
fn disjoint_lists_replace_pairwise() {
    // replaces count one operation each where remove + insert would be two
    let (sink, _) = run(&[1, 2, 3], &[4, 5, 6]);
    assert_eq!(sink.op_count(), 3);
    assert!(sink
        .ops
        .iter()
        .all(|op| matches!(op, NodeOp::ReplaceChild { .. })));
}

#[test]
fn single_move_to_front() {
    let (sink, _) = run(&[1, 2, 3, 4], &[4, 1, 2, 3]);
    assert_eq!(sink.op_count(), 1);
}

#[test]
fn single_move_to_back() {
    let (sink, _) = run(&[1, 2, 3, 4], &[2, 3, 4, 1]);
    assert_eq!(sink.op_count(), 1);
}

#[test]
fn adjacent_swap_is_one_move() {
    let (sink, _) = run(&[1, 2], &[2, 1]);
    assert_eq!(sink.op_count(), 1);
}

#[test]
fn empty_to_populated_and_back() {
    let (sink, _) = run(&[], &[1, 2, 3]);
    assert_eq!(sink.op_count(), 3);

    let (sink, _) = run(&[1, 2, 3], &[]);
    assert_eq!(sink.op_count(), 3);
    assert!(sink
        .ops
        .iter()
        .all(|op| matches!(op, NodeOp::RemoveChild { .. })));
}

#[test]
fn no_ops_for_identical_lists() {
    let (sink, _) = run(&[1, 2, 3, 4], &[1, 2, 3, 4]);
    assert_eq!(sink.op_count(), 0);
}

#[test]
fn reconcile_respects_settled_siblings_outside_the_range() {
    // the reconciled region is the whole child list; a shared suffix must be
    // used as the insertion anchor rather than blind appends
    let (sink, _) = run(&[1, 2, 9], &[1, 3, 4, 9]);
    let children = sink.sink.children(PARENT);
    assert_eq!(children, &[1, 3, 4, 9]);
}

#[test]
fn randomized_lists_always_converge() {
    let mut rng = SmallRng::seed_from_u64(0x5711CE);
    let universe: Vec<usize> = (1..=12).collect();

    for _ in 0..1000 {
        let mut pool = universe.clone();
        pool.shuffle(&mut rng);
        let current: Vec<usize> = pool[..rng.gen_range(0..=pool.len())].to_vec();

        let mut pool = universe.clone();
        pool.shuffle(&mut rng);
        let next: Vec<usize> = pool[..rng.gen_range(0..=pool.len())].to_vec();

        let (mut sink, mut mirror) = setup(&current);
        reconcile(&mut sink, &PARENT, &mut mirror, &next);

        assert_eq!(
            sink.sink.children(PARENT),
            &next[..],
            "diverged on {current:?} -> {next:?}"
        );
        assert_eq!(mirror, next, "mirror diverged on {current:?} -> {next:?}");
        // loose sanity bound; exact minimality is pinned by the scenario tests
        assert!(
            sink.op_count() <= 2 * (current.len() + next.len()),
            "{} ops for {current:?} -> {next:?}",
            sink.op_count()
        );
    }
}

#[test]
fn randomized_permutations_of_the_same_set() {
    let mut rng = SmallRng::seed_from_u64(0xD1FF);

    for len in 0..=10usize {
        for _ in 0..200 {
            let current: Vec<usize> = (1..=len).collect();
            let mut next = current.clone();
            next.shuffle(&mut rng);

            let (mut sink, mut mirror) = setup(&current);
            reconcile(&mut sink, &PARENT, &mut mirror, &next);
            assert_eq!(sink.sink.children(PARENT), &next[..]);
            assert_eq!(mirror, next);
            // pure permutations never need removes or replaces
            assert!(sink
                .ops
                .iter()
                .all(|op| matches!(op, NodeOp::InsertBefore { .. })));
        }
    }
}
