use super::*;

use proptest::prelude::*;
use proptest_derive::Arbitrary;

/// Check the structural invariants and return the number of reachable nodes.
fn validate_trie(t: &CidrTrie) -> usize {
    let mut reachable = 0usize;
    let mut stack: Vec<(Ptr, i32)> = vec![(t.root, ROOT_BIT)];

    while let Some((ptr, bit)) = stack.pop() {
        if !ptr.is_node() {
            continue;
        }
        assert!(bit >= 0, "node below the last address bit");
        reachable += 1;

        let children = t.nodes.children(ptr.node_idx());
        assert_ne!(children, [Ptr::ALL; 2], "uncollapsed node at bit {bit}");
        assert_ne!(children, [Ptr::NONE; 2], "empty node at bit {bit}");
        for child in children {
            stack.push((child, bit - 1));
        }
    }

    assert_eq!(
        reachable,
        t.node_count(),
        "live arena nodes must all be reachable from the root"
    );
    reachable
}

/// Sorted, disjoint, non-adjacent inclusive intervals.
fn normalize(mut intervals: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    intervals.sort_unstable();
    let mut out: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
    for (lo, hi) in intervals {
        match out.last_mut() {
            Some(last) if lo <= last.1 + 1 => last.1 = last.1.max(hi),
            _ => out.push((lo, hi)),
        }
    }
    out
}

fn block_interval(b: Block) -> (u64, u64) {
    (u64::from(b.first()), u64::from(b.last()))
}

/// Blocks must be ascending, disjoint, and no two may be mergeable siblings.
fn check_blocks(blocks: &[Block]) {
    for pair in blocks.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        assert!(a.last() < b.first(), "blocks overlap or are out of order: {a} {b}");
        let siblings = a.prefix_len() == b.prefix_len()
            && a.prefix_len() > 0
            && Block::new(a.addr(), a.prefix_len() - 1) == Block::new(b.addr(), b.prefix_len() - 1);
        assert!(!siblings, "sibling blocks {a} and {b} should have collapsed");
    }
}

/// Addresses near the interesting region, plus a few anywhere in the space.
fn addr_strategy() -> impl Strategy<Value = u32> {
    const BASE: u32 = 0x0A00_0000;
    prop_oneof![
        8 => (0u32..4096).prop_map(|off| BASE + off),
        1 => (u32::MAX - 64..=u32::MAX),
        1 => (0u32..64),
        1 => any::<u32>(),
    ]
}

#[derive(Clone, Debug, Arbitrary)]
enum Op {
    #[proptest(weight = 4)]
    Address(#[proptest(strategy = "addr_strategy()")] u32),
    #[proptest(weight = 4)]
    Range(
        #[proptest(strategy = "addr_strategy()")] u32,
        #[proptest(strategy = "addr_strategy()")] u32,
    ),
    #[proptest(weight = 3)]
    Cidr(
        #[proptest(strategy = "addr_strategy()")] u32,
        #[proptest(strategy = "20u8..=32")] u8,
    ),
    #[proptest(weight = 1)]
    Compact,
}

impl Op {
    /// Apply to the trie and return the interval it adds, if any.
    fn apply(&self, t: &mut CidrTrie) -> Option<(u64, u64)> {
        match *self {
            Op::Address(a) => {
                t.insert_address(a);
                Some((u64::from(a), u64::from(a)))
            }
            Op::Range(a, b) => {
                let (lo, hi) = (a.min(b), a.max(b));
                t.insert_range(lo, hi);
                Some((u64::from(lo), u64::from(hi)))
            }
            Op::Cidr(a, len) => {
                t.insert_cidr(a, len);
                Some(block_interval(Block::new(a, len)))
            }
            Op::Compact => {
                t.compact();
                None
            }
        }
    }
}

/// Minimal aligned-block count for `[lo, hi]` by dynamic programming.
fn min_blocks_brute_force(lo: u64, hi: u64) -> usize {
    let n = (hi - lo + 1) as usize;
    // best[i]: fewest blocks covering [lo + i, hi].
    let mut best = vec![usize::MAX; n + 1];
    best[n] = 0;
    for i in (0..n).rev() {
        let start = lo + i as u64;
        let mut size = 1u64;
        while size <= 1 << 32 && start % size == 0 && start + size - 1 <= hi {
            let next = i + size as usize;
            best[i] = best[i].min(1 + best[next]);
            size <<= 1;
        }
    }
    best[0]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 10_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_union_matches_model(ops in prop::collection::vec(any::<Op>(), 0..=200)) {
        let mut t = CidrTrie::new();
        let mut inputs = Vec::new();

        for op in &ops {
            if let Some(iv) = op.apply(&mut t) {
                inputs.push(iv);
            }
        }

        validate_trie(&t);
        let blocks = t.emit_blocks();
        check_blocks(&blocks);

        let expected = normalize(inputs.clone());
        let got = normalize(blocks.iter().copied().map(block_interval).collect());
        prop_assert_eq!(&got, &expected);

        // Check membership around every input edge.
        for &(lo, hi) in &inputs {
            for addr in [lo.wrapping_sub(1), lo, hi, hi + 1] {
                if addr > u64::from(u32::MAX) {
                    continue;
                }
                let inside = expected.iter().any(|&(l, h)| l <= addr && addr <= h);
                prop_assert_eq!(t.contains(addr as u32), inside, "address {}", addr);
            }
        }

        let total: u64 = expected.iter().map(|&(l, h)| h - l + 1).sum();
        prop_assert_eq!(t.address_count(), total);
    }

    #[test]
    fn prop_idempotent(ops in prop::collection::vec(any::<Op>(), 0..=100)) {
        let mut t = CidrTrie::new();
        for op in &ops {
            op.apply(&mut t);
        }
        let once = t.emit_blocks();
        let nodes = t.node_count();

        for op in &ops {
            op.apply(&mut t);
        }
        validate_trie(&t);
        prop_assert_eq!(t.emit_blocks(), once);
        prop_assert_eq!(t.node_count(), nodes);
    }

    #[test]
    fn prop_insert_order_irrelevant(
        ops in prop::collection::vec(any::<Op>(), 0..=60),
        seed in any::<u64>(),
    ) {
        use rand::seq::SliceRandom;
        use rand::{rngs::StdRng, SeedableRng};

        let mut a = CidrTrie::new();
        for op in &ops {
            op.apply(&mut a);
        }

        let mut shuffled = ops.clone();
        shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
        let mut b = CidrTrie::new();
        for op in &shuffled {
            op.apply(&mut b);
        }

        prop_assert_eq!(a.emit_blocks(), b.emit_blocks());
        prop_assert_eq!(validate_trie(&a), validate_trie(&b));
    }

    #[test]
    fn prop_range_decomposition(lo in any::<u32>(), span in 0u32..1 << 20) {
        let hi = lo.saturating_add(span);
        let blocks: Vec<Block> = range_blocks(lo, hi).collect();

        let mut next = u64::from(lo);
        for b in &blocks {
            prop_assert_eq!(u64::from(b.first()), next, "blocks must be contiguous");
            prop_assert_eq!(Block::new(b.addr(), b.prefix_len()), *b, "block must be aligned");
            next = u64::from(b.last()) + 1;
        }
        prop_assert_eq!(next, u64::from(hi) + 1);

        // Greedy is optimal: no block can be widened without leaving the range.
        for b in &blocks {
            if b.prefix_len() > 0 {
                let parent = Block::new(b.addr(), b.prefix_len() - 1);
                prop_assert!(parent.first() < lo || parent.last() > hi);
            }
        }
    }

    #[test]
    fn prop_range_block_count_minimal(lo in any::<u32>(), span in 0u32..2048) {
        let hi = lo.saturating_add(span);
        let count = range_blocks(lo, hi).count();
        prop_assert_eq!(count, min_blocks_brute_force(u64::from(lo), u64::from(hi)));
    }

    #[test]
    fn prop_range_equals_addresses(lo in 0u32..1024, span in 0u32..256) {
        let hi = lo + span;
        let mut by_range = CidrTrie::new();
        by_range.insert_range(lo, hi);

        let mut by_address = CidrTrie::new();
        for a in lo..=hi {
            by_address.insert_address(a);
        }

        prop_assert_eq!(by_range.emit_blocks(), by_address.emit_blocks());
        prop_assert_eq!(by_range.node_count(), by_address.node_count());
        validate_trie(&by_range);
        validate_trie(&by_address);
    }
}

/// Advance `idx` to the next lexicographic permutation; false once it wraps.
fn next_permutation(idx: &mut [usize]) -> bool {
    let Some(pivot) = idx.windows(2).rposition(|w| w[0] < w[1]) else {
        return false;
    };
    let swap = idx.iter().rposition(|&x| x > idx[pivot]).unwrap();
    idx.swap(pivot, swap);
    idx[pivot + 1..].reverse();
    true
}

/// Call `f` with every ordering of `items`.
fn each_ordering<T>(items: &[T], mut f: impl FnMut(Vec<&T>)) {
    let mut idx: Vec<usize> = (0..items.len()).collect();
    loop {
        f(idx.iter().map(|&i| &items[i]).collect());
        if !next_permutation(&mut idx) {
            break;
        }
    }
}

#[test]
fn exhaustive_insert_order_small_set() {
    let ops = vec![
        Op::Cidr(0x0A00_0000, 25),
        Op::Cidr(0x0A00_0080, 25),
        Op::Range(0x0A00_0100, 0x0A00_01FE),
        Op::Address(0x0A00_01FF),
        Op::Address(0x0A00_0205),
        Op::Range(0x0A00_0200, 0x0A00_0203),
    ];

    let mut expected = None;
    let mut orderings = 0usize;
    each_ordering(&ops, |perm| {
        orderings += 1;
        let mut t = CidrTrie::new();
        for op in perm {
            op.apply(&mut t);
        }
        validate_trie(&t);

        let got: Vec<String> = t.blocks().map(|b| b.to_string()).collect();
        assert_eq!(got, ["10.0.0.0/23", "10.0.2.0/30", "10.0.2.5/32"]);
        match &expected {
            None => expected = Some(t.node_count()),
            Some(n) => assert_eq!(t.node_count(), *n),
        }
    });
    assert_eq!(orderings, 720);
}

#[test]
fn exhaustive_small_ranges() {
    // Every range inside a 64-address window, checked address by address.
    const BASE: u32 = 0xC0A8_0100;
    for lo in 0..64u32 {
        for hi in lo..64u32 {
            let mut t = CidrTrie::new();
            t.insert_range(BASE + lo, BASE + hi);
            validate_trie(&t);
            check_blocks(&t.emit_blocks());
            for a in 0..64u32 {
                assert_eq!(t.contains(BASE + a), (lo..=hi).contains(&a), "[{lo}, {hi}] at {a}");
            }
            assert_eq!(t.address_count(), u64::from(hi - lo + 1));
        }
    }
}
