//! Global collections checked against a reachability model on randomized
//! object graphs.
//!
//! Each case builds a pseudo-random graph spread over every region, computes
//! reachability in a side model and compares the collector's outcome with
//! it: the mark bit of every object, the marked-object count, and
//! remembered-set coverage for every reference out of a surviving object.

use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::toy_heap;
use crate::mark::MarkDelegateState;
use crate::util::test_util::serial_test;
use crate::util::test_util::toy_vm;
use crate::util::test_util::ToyHeapWriter;
use crate::util::ObjectReference;

const OBJECTS: usize = 400;
const MUTATIONS: usize = 120;
const ROOT_FANOUT: usize = 8;

struct Node {
    object: ObjectReference,
    /// Slot targets as indices into the node list, kept in step with the
    /// heap through every mutation.
    slots: Vec<Option<usize>>,
}

/// Leaves, scalars with backward references, and object arrays whose slots
/// a later mutation pass fills in.
fn build_graph(rng: &mut ChaCha8Rng, writers: &mut [ToyHeapWriter]) -> Vec<Node> {
    let mut nodes: Vec<Node> = Vec::with_capacity(OBJECTS);
    for i in 0..OBJECTS {
        let writer = &mut writers[rng.random_range(0..writers.len())];
        let roll = rng.random_range(0..100);
        let node = if roll < 30 {
            Node {
                object: writer.leaf(rng.random_range(0..4)),
                slots: Vec::new(),
            }
        } else if roll < 85 {
            let mut slots = Vec::new();
            for _ in 0..rng.random_range(0..=4usize) {
                slots.push((i > 0 && rng.random_bool(0.6)).then(|| rng.random_range(0..i)));
            }
            let targets: Vec<Option<ObjectReference>> = slots
                .iter()
                .map(|t| t.map(|index| nodes[index].object))
                .collect();
            Node {
                object: writer.scalar(&targets),
                slots,
            }
        } else {
            let len = rng.random_range(1..=24);
            Node {
                object: writer.array(len),
                slots: vec![None; len],
            }
        };
        nodes.push(node);
    }
    nodes
}

/// Forward edges the creation order could not produce, including into
/// array slots.
fn mutate(rng: &mut ChaCha8Rng, writer: &ToyHeapWriter, nodes: &mut [Node]) {
    let mut done = 0;
    while done < MUTATIONS {
        let index = rng.random_range(0..nodes.len());
        if nodes[index].slots.is_empty() {
            continue;
        }
        let slot = rng.random_range(0..nodes[index].slots.len());
        let target = rng.random_range(0..nodes.len());
        writer.set_slot(nodes[index].object, slot, nodes[target].object);
        nodes[index].slots[slot] = Some(target);
        done += 1;
    }
}

fn reachable_from(roots: &[usize], nodes: &[Node]) -> Vec<bool> {
    let mut reachable = vec![false; nodes.len()];
    let mut queue: Vec<usize> = Vec::new();
    for &root in roots {
        if !reachable[root] {
            reachable[root] = true;
            queue.push(root);
        }
    }
    while let Some(index) = queue.pop() {
        for &target in nodes[index].slots.iter().flatten() {
            if !reachable[target] {
                reachable[target] = true;
                queue.push(target);
            }
        }
    }
    reachable
}

/// Build a graph, pick roots, collect, and compare with the model. The
/// collection itself is supplied so the stop-the-world and incremental
/// paths share the scenario. Only a full collection rebuilds every
/// remembered-set list; `rebuilds_lists` gates the coverage check.
fn check_seed(
    seed: u64,
    rebuilds_lists: bool,
    collect: impl FnOnce(&mut crate::RegMark<toy_vm::ToyVM>),
) {
    toy_vm::reset();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut regmark = toy_heap(|_| {});
    let mut writers: Vec<ToyHeapWriter> = (0..regmark.region_manager().region_count())
        .map(|i| ToyHeapWriter::new(regmark.region_manager().region(i).range()))
        .collect();

    let mut nodes = build_graph(&mut rng, &mut writers);
    mutate(&mut rng, &writers[0], &mut nodes);

    let root_indexes: Vec<usize> = (0..ROOT_FANOUT)
        .map(|_| rng.random_range(0..nodes.len()))
        .collect();
    let targets: Vec<Option<ObjectReference>> = root_indexes
        .iter()
        .map(|&index| Some(nodes[index].object))
        .collect();
    let holder = writers[0].scalar(&targets);
    for slot in 0..ROOT_FANOUT {
        toy_vm::add_root(writers[0].slot_addr(holder, slot));
    }

    collect(&mut regmark);
    assert_eq!(regmark.mark_state(), MarkDelegateState::Idle);

    let reachable = reachable_from(&root_indexes, &nodes);
    let expected = reachable.iter().filter(|r| **r).count() as u64;
    assert_eq!(regmark.mark_stats().objects_marked, expected);
    for (node, reachable) in nodes.iter().zip(reachable.iter()) {
        assert_eq!(regmark.mark_map().is_marked(node.object), *reachable);
    }
    // A full collection rebuilds every list, so each reference out of a
    // live object must be covered afterwards.
    assert_eq!(regmark.remembered_set_stats().overflowed_regions, 0);
    if rebuilds_lists {
        for (node, reachable) in nodes.iter().zip(reachable.iter()) {
            if !*reachable {
                continue;
            }
            for &target in node.slots.iter().flatten() {
                assert!(regmark.is_reference_remembered(node.object, nodes[target].object));
            }
        }
    }
    regmark.finish_cycle();
}

#[test]
fn a_global_collection_agrees_with_the_reachability_model() {
    serial_test(|| check_seed(0xA11CE, true, |regmark| regmark.perform_mark_for_global_gc()));
}

#[test]
fn a_second_seed_agrees_as_well() {
    serial_test(|| check_seed(0xB0B, true, |regmark| regmark.perform_mark_for_global_gc()));
}

#[test]
fn many_short_increments_mark_the_same_set() {
    serial_test(|| {
        check_seed(0xCAFE, false, |regmark| {
            let mut increments = 0;
            while !regmark.perform_mark_incremental(Instant::now() + Duration::from_micros(200)) {
                increments += 1;
                assert!(increments < 10_000, "mark cycle failed to terminate");
            }
        })
    });
}
