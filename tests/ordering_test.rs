//! Similarity hashing and ordering invariants.

mod common;

use common::random_bytes;
use dwarfs::nilsimsa::{self, Nilsimsa};
use dwarfs::ordering::{SimilarityOrdering, SimilarityOrderingOptions, OrderElement};
use proptest::prelude::*;

// ── Nilsimsa ─────────────────────────────────────────────────────────────────

#[test]
fn identical_inputs_have_distance_zero() {
    let a = nilsimsa::digest(b"the quick brown fox jumps over the lazy dog");
    let b = nilsimsa::digest(b"the quick brown fox jumps over the lazy dog");
    assert_eq!(nilsimsa::distance(&a, &b), 0);
    assert_eq!(nilsimsa::similarity(&a, &b), 128);
}

#[test]
fn similar_inputs_are_closer_than_random_ones() {
    let base = random_bytes(1, 8192);
    let mut tweaked = base.clone();
    for i in (0..tweaked.len()).step_by(512) {
        tweaked[i] ^= 0x01;
    }
    let unrelated = random_bytes(99, 8192);

    let d_base = nilsimsa::digest(&base);
    let d_tweak = nilsimsa::digest(&tweaked);
    let d_other = nilsimsa::digest(&unrelated);

    assert!(
        nilsimsa::distance(&d_base, &d_tweak) < nilsimsa::distance(&d_base, &d_other),
        "a lightly tweaked copy must stay closer than unrelated data"
    );
}

proptest! {
    /// Feeding data in arbitrary splits equals one-shot hashing.
    #[test]
    fn streaming_equals_oneshot(
        data in proptest::collection::vec(any::<u8>(), 0..2048),
        split in 0usize..2048,
    ) {
        let split = split.min(data.len());
        let mut h = Nilsimsa::new();
        h.update(&data[..split]);
        h.update(&data[split..]);
        prop_assert_eq!(h.finalize(), nilsimsa::digest(&data));
    }
}

// ── Ordering ─────────────────────────────────────────────────────────────────

fn element(data: &[u8], size: u64, rev_path: &str) -> OrderElement {
    OrderElement {
        digest: Some(nilsimsa::digest(data)),
        size,
        rev_path: rev_path.to_owned(),
    }
}

#[test]
fn output_is_a_permutation() {
    let elements: Vec<OrderElement> = (0..50)
        .map(|i| element(&random_bytes(i as u64 + 1, 4096), 100 + i, &format!("f{i}")))
        .collect();

    let order =
        SimilarityOrdering::new(&elements, SimilarityOrderingOptions::default()).run();

    let mut sorted = order.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (0..50).collect::<Vec<u32>>());
}

#[test]
fn items_without_digest_are_skipped() {
    let mut elements: Vec<OrderElement> = (0..10)
        .map(|i| element(&random_bytes(i as u64 + 1, 1024), 10, &format!("f{i}")))
        .collect();
    elements[3].digest = None;
    elements[7].digest = None;

    let order =
        SimilarityOrdering::new(&elements, SimilarityOrderingOptions::default()).run();
    assert_eq!(order.len(), 8);
    assert!(!order.contains(&3));
    assert!(!order.contains(&7));
}

#[test]
fn duplicates_stay_contiguous_in_secondary_order() {
    // Three items with identical signatures but different sizes/paths,
    // mixed with unrelated items.
    let dup_data = random_bytes(42, 4096);
    let mut elements = vec![
        element(&dup_data, 50, "zz/dup-small"),
        element(&random_bytes(2, 4096), 10, "a"),
        element(&dup_data, 300, "aa/dup-large"),
        element(&random_bytes(3, 4096), 10, "b"),
        element(&dup_data, 300, "bb/dup-large-2"),
    ];
    // One more unrelated element so clustering has something to do.
    elements.push(element(&random_bytes(4, 4096), 10, "c"));

    let order =
        SimilarityOrdering::new(&elements, SimilarityOrderingOptions::default()).run();

    let dup_group = [0u32, 2, 4];
    let positions: Vec<usize> = dup_group
        .iter()
        .map(|i| order.iter().position(|x| x == i).unwrap())
        .collect();

    let min = *positions.iter().min().unwrap();
    let max = *positions.iter().max().unwrap();
    assert_eq!(max - min, 2, "duplicate group must be contiguous: {order:?}");

    // Within the group: representative first, then size descending, then
    // reverse path.
    let window = &order[min..=max];
    let rep_pos = window.iter().position(|&x| dup_group.contains(&x)).unwrap();
    let rep = window[rep_pos];
    let rest: Vec<u32> = window.iter().copied().filter(|&x| x != rep).collect();
    assert_eq!(rest, vec![2, 4], "duplicates sorted by size desc, then rev path");
}

#[test]
fn similar_items_end_up_adjacent() {
    // Two families of similar items plus noise; items of one family
    // should cluster together in the output.
    let fam_a = random_bytes(100, 8192);
    let fam_b = random_bytes(200, 8192);

    let mut elements = Vec::new();
    for i in 0..8u64 {
        let mut v = fam_a.clone();
        v[i as usize * 7] ^= 0xFF;
        elements.push(element(&v, 100, &format!("a{i}")));
    }
    for i in 0..8u64 {
        let mut v = fam_b.clone();
        v[i as usize * 11] ^= 0xFF;
        elements.push(element(&v, 100, &format!("b{i}")));
    }

    let order =
        SimilarityOrdering::new(&elements, SimilarityOrderingOptions::default()).run();

    // Count family transitions along the order; a good clustering has
    // exactly one boundary, noise-free input being this easy.
    let transitions = order
        .windows(2)
        .filter(|w| (w[0] < 8) != (w[1] < 8))
        .count();
    assert!(
        transitions <= 3,
        "families are interleaved ({transitions} transitions): {order:?}"
    );
}
