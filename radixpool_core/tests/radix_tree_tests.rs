use proptest::collection::vec as pvec;
use proptest::prelude::*;
use radixpool_core::{key_from_u64, Emplaced, Error, Pool, RadixTree};
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

fn setup(capacity: usize) -> (Pool, RadixTree) {
    let name = format!("test_tree_{}", rand::random::<u64>());
    let pool = Pool::open(&name, capacity).unwrap();
    let tree = RadixTree::open(&pool).unwrap();
    tree.runtime_initialize().unwrap();
    (pool, tree)
}

#[test]
fn basic_emplace_find_erase() {
    let (_pool, tree) = setup(64);
    let w = tree.register_worker().unwrap();

    w.critical(|cs| assert!(tree.find(cs, b"alpha").is_none()));
    assert_eq!(tree.emplace(b"alpha", b"1").unwrap(), Emplaced::Inserted);
    w.critical(|cs| {
        let entry = tree.find(cs, b"alpha").expect("alpha present");
        assert_eq!(entry.key(), b"alpha");
        assert_eq!(entry.value(), b"1");
    });

    assert!(tree.erase(b"alpha").unwrap());
    assert!(!tree.erase(b"alpha").unwrap());
    w.critical(|cs| assert!(tree.find(cs, b"alpha").is_none()));
    assert!(tree.is_empty());
}

#[test]
fn update_replaces_value_and_defers_old_leaf() {
    let (pool, tree) = setup(64);
    let w = tree.register_worker().unwrap();
    tree.emplace(b"k", b"old").unwrap();
    let before = pool.allocation_count();

    assert_eq!(tree.emplace(b"k", b"new").unwrap(), Emplaced::Updated);
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.pending_count(), 1);
    // new leaf + pending entry, old leaf not yet freed
    assert_eq!(pool.allocation_count(), before + 2);
    w.critical(|cs| assert_eq!(tree.find(cs, b"k").unwrap().value(), b"new"));

    assert_eq!(tree.garbage_collect().unwrap(), 1);
    assert_eq!(pool.allocation_count(), before);
}

#[test]
fn prefix_keys_use_terminal_slots() {
    let (_pool, tree) = setup(256);
    let w = tree.register_worker().unwrap();
    let keys: [&[u8]; 6] = [b"", b"a", b"ab", b"abc", b"abd", b"b"];
    for key in keys {
        tree.emplace(key, key).unwrap();
    }
    w.critical(|cs| {
        for key in keys {
            assert_eq!(tree.find(cs, key).unwrap().value(), key);
        }
        assert!(tree.find(cs, b"abcd").is_none());
        assert!(tree.find(cs, b"ac").is_none());
    });

    assert!(tree.erase(b"ab").unwrap());
    assert!(tree.erase(b"").unwrap());
    w.critical(|cs| {
        assert!(tree.find(cs, b"ab").is_none());
        assert!(tree.find(cs, b"").is_none());
        for key in [&b"a"[..], b"abc", b"abd", b"b"] {
            assert_eq!(tree.find(cs, key).unwrap().value(), key);
        }
    });
}

#[test]
fn erase_of_inner_prefix_is_not_found() {
    let (_pool, tree) = setup(64);
    tree.emplace(b"abc", b"1").unwrap();
    tree.emplace(b"abd", b"2").unwrap();
    assert!(!tree.erase(b"ab").unwrap());
    assert!(!tree.erase(b"a").unwrap());
    assert!(!tree.erase(b"abcd").unwrap());
    assert_eq!(tree.len(), 2);
    assert_eq!(tree.pending_count(), 0);
}

#[test]
fn branch_left_with_one_slot_is_merged() {
    let (pool, tree) = setup(64);
    let w = tree.register_worker().unwrap();
    for key in [&b"ab"[..], b"abc", b"abd"] {
        tree.emplace(key, key).unwrap();
    }
    w.critical(|cs| assert_eq!(tree.node_counts(cs).min_branch_fanout, Some(3)));

    // terminal + "abd" remain
    assert!(tree.erase(b"abc").unwrap());
    w.critical(|cs| assert_eq!(tree.node_counts(cs).min_branch_fanout, Some(2)));

    // only "abd" remains, so the branch goes too
    assert!(tree.erase(b"ab").unwrap());
    w.critical(|cs| {
        let counts = tree.node_counts(cs);
        assert_eq!((counts.leaves, counts.branches), (1, 0));
        assert_eq!(counts.min_branch_fanout, None);
        assert_eq!(tree.find(cs, b"abd").unwrap().value(), b"abd");
    });
    drop(w);
    tree.garbage_collect_force().unwrap();
    assert_eq!(pool.allocation_count(), 2);
}

#[test]
fn iteration_is_sorted() {
    let (_pool, tree) = setup(4096);
    let w = tree.register_worker().unwrap();
    let mut expected = Vec::new();
    for i in (0..300u64).rev() {
        let key = key_from_u64(i * 7919 % 1000);
        tree.emplace(&key, &i.to_le_bytes()).unwrap();
        expected.push(key.to_vec());
    }
    expected.sort();
    expected.dedup();

    w.critical(|cs| {
        let keys: Vec<Vec<u8>> = tree.iter(cs).map(|e| e.key().to_vec()).collect();
        assert_eq!(keys, expected);
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    });
}

#[test]
fn bounds_follow_key_order() {
    let (_pool, tree) = setup(64);
    let w = tree.register_worker().unwrap();
    for key in [&b"b"[..], b"bb", b"d"] {
        tree.emplace(key, b"").unwrap();
    }
    w.critical(|cs| {
        assert_eq!(tree.lower_bound(cs, b"a").unwrap().key(), b"b");
        assert_eq!(tree.lower_bound(cs, b"b").unwrap().key(), b"b");
        assert_eq!(tree.upper_bound(cs, b"b").unwrap().key(), b"bb");
        assert_eq!(tree.lower_bound(cs, b"c").unwrap().key(), b"d");
        assert!(tree.upper_bound(cs, b"d").is_none());
        assert!(tree.contains(cs, b"bb"));
    });
}

#[test]
fn bounds_skip_whole_subtrees() {
    let (_pool, tree) = setup(64);
    let w = tree.register_worker().unwrap();
    for key in [&b"ab"[..], b"abc", b"abx", b"b", b"bca", b"bcb"] {
        tree.emplace(key, b"").unwrap();
    }
    w.critical(|cs| {
        let lower = |key: &[u8]| tree.lower_bound(cs, key).map(|e| e.key().to_vec());
        let upper = |key: &[u8]| tree.upper_bound(cs, key).map(|e| e.key().to_vec());
        assert_eq!(lower(b""), Some(b"ab".to_vec()));
        assert_eq!(lower(b"a"), Some(b"ab".to_vec()));
        // exact prefix: terminal when inclusive, first child otherwise
        assert_eq!(lower(b"ab"), Some(b"ab".to_vec()));
        assert_eq!(upper(b"ab"), Some(b"abc".to_vec()));
        assert_eq!(lower(b"abd"), Some(b"abx".to_vec()));
        // past every child of "ab"
        assert_eq!(lower(b"aby"), Some(b"b".to_vec()));
        assert_eq!(upper(b"abx"), Some(b"b".to_vec()));
        // below a compressed prefix
        assert_eq!(lower(b"bb"), Some(b"bca".to_vec()));
        assert_eq!(upper(b"bc"), Some(b"bca".to_vec()));
        assert_eq!(lower(b"bcab"), Some(b"bcb".to_vec()));
        assert_eq!(lower(b"bcc"), None);
        assert_eq!(upper(b"bcb"), None);
    });
}

#[test]
fn erasing_last_key_leaves_empty_tree() {
    let (pool, tree) = setup(64);
    let w = tree.register_worker().unwrap();
    for key in [&b"x1"[..], b"x2", b"y"] {
        tree.emplace(key, b"v").unwrap();
    }
    for key in [&b"x1"[..], b"x2", b"y"] {
        assert!(tree.erase(key).unwrap());
    }
    drop(w);
    assert!(tree.is_empty());
    tree.garbage_collect_force().unwrap();
    assert_eq!(tree.pending_count(), 0);
    // only the tree root object remains
    assert_eq!(pool.allocation_count(), 1);

    let w = tree.register_worker().unwrap();
    w.critical(|cs| {
        assert_eq!(tree.node_counts(cs).leaves, 0);
        assert_eq!(tree.iter(cs).count(), 0);
    });
}

#[test]
fn reader_pins_detached_leaf() {
    let (pool, tree) = setup(64);
    let w = tree.register_worker().unwrap();
    tree.emplace(b"key", b"value").unwrap();

    w.critical(|cs| {
        let seen = tree.find(cs, b"key").unwrap();
        assert!(tree.erase(b"key").unwrap());
        assert_eq!(tree.garbage_collect().unwrap(), 0);
        // still readable: the leaf is detached, not freed
        assert_eq!(seen.value(), b"value");
        assert!(tree.find(cs, b"key").is_none());
    });

    assert_eq!(tree.pending_count(), 1);
    assert_eq!(tree.garbage_collect().unwrap(), 1);
    assert_eq!(pool.allocation_count(), 1);
}

#[test]
fn clear_hands_everything_to_collector() {
    let (pool, tree) = setup(1024);
    for i in 0..50u64 {
        tree.emplace(&key_from_u64(i), b"payload").unwrap();
    }
    let live = pool.allocation_count();
    assert_eq!(tree.clear().unwrap(), 50);
    assert!(tree.is_empty());
    // one pending entry per detached node
    assert_eq!(pool.allocation_count(), live + tree.pending_count());
    tree.garbage_collect_force().unwrap();
    assert_eq!(pool.allocation_count(), 1);
}

#[test]
fn runtime_lifecycle_is_enforced() {
    let name = format!("test_runtime_{}", rand::random::<u64>());
    let pool = Pool::open(&name, 64).unwrap();
    let tree = RadixTree::open(&pool).unwrap();

    assert_eq!(tree.emplace(b"a", b"1"), Err(Error::RuntimeNotInitialized));
    assert_eq!(tree.garbage_collect(), Err(Error::RuntimeNotInitialized));
    assert!(matches!(tree.register_worker(), Err(Error::RuntimeNotInitialized)));
    assert_eq!(tree.runtime_finalize(), Err(Error::RuntimeNotInitialized));

    tree.runtime_initialize().unwrap();
    assert_eq!(tree.runtime_initialize(), Err(Error::RuntimeAlreadyInitialized));

    let w = tree.register_worker().unwrap();
    assert_eq!(tree.runtime_finalize(), Err(Error::WorkersStillRegistered(1)));
    // still usable after the refused finalize
    tree.emplace(b"a", b"1").unwrap();
    drop(w);
    tree.runtime_finalize().unwrap();
}

#[test]
fn destroy_requires_finalized_runtime() {
    let (pool, tree) = setup(64);
    tree.emplace(b"a", b"1").unwrap();
    assert_eq!(tree.destroy(), Err(Error::RuntimeStillActive));

    // the handle is gone; reattach and tear down properly
    let tree = RadixTree::open(&pool).unwrap();
    assert_eq!(tree.len(), 1);
    tree.destroy().unwrap();
    assert_eq!(pool.allocation_count(), 0);
}

#[test]
fn second_tree_handle_is_rejected() {
    let (pool, tree) = setup(64);
    assert!(matches!(RadixTree::open(&pool), Err(Error::AlreadyAttached)));
    drop(tree);
    assert!(RadixTree::open(&pool).is_ok());
}

#[test]
#[should_panic(expected = "different tree")]
fn token_from_other_tree_is_rejected() {
    let (_pool_a, tree_a) = setup(16);
    let (_pool_b, tree_b) = setup(16);
    let w = tree_b.register_worker().unwrap();
    w.critical(|cs| {
        let _ = tree_a.find(cs, b"k");
    });
}

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Del(Vec<u8>),
}

/// Every key up to `max_len` bytes over `0..alphabet`.
fn all_keys(alphabet: u8, max_len: usize) -> Vec<Vec<u8>> {
    let mut keys = vec![Vec::new()];
    let mut layer = vec![Vec::new()];
    for _ in 0..max_len {
        layer = layer
            .iter()
            .flat_map(|prefix: &Vec<u8>| {
                (0..alphabet).map(move |b| {
                    let mut key = prefix.clone();
                    key.push(b);
                    key
                })
            })
            .collect();
        keys.extend(layer.iter().cloned());
    }
    keys
}

fn op_strategy() -> impl Strategy<Value = Op> {
    // tiny alphabet and short keys force shared prefixes and terminal slots
    let key = pvec(0u8..4, 0..5);
    prop_oneof![
        3 => (key.clone(), pvec(any::<u8>(), 0..8)).prop_map(|(k, v)| Op::Put(k, v)),
        2 => key.prop_map(Op::Del),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn matches_btreemap_model(ops in pvec(op_strategy(), 1..120)) {
        let (pool, tree) = setup(4096);
        let mut model = BTreeMap::new();

        for op in &ops {
            match op {
                Op::Put(k, v) => {
                    let expected = if model.insert(k.clone(), v.clone()).is_some() {
                        Emplaced::Updated
                    } else {
                        Emplaced::Inserted
                    };
                    prop_assert_eq!(tree.emplace(k, v).unwrap(), expected);
                }
                Op::Del(k) => {
                    prop_assert_eq!(tree.erase(k).unwrap(), model.remove(k).is_some());
                }
            }
        }
        prop_assert_eq!(tree.len(), model.len());

        let w = tree.register_worker().unwrap();
        let counts = w.critical(|cs| {
            let entries: Vec<(Vec<u8>, Vec<u8>)> = tree
                .iter(cs)
                .map(|e| (e.key().to_vec(), e.value().to_vec()))
                .collect();
            let expected: Vec<(Vec<u8>, Vec<u8>)> = model.clone().into_iter().collect();
            assert_eq!(entries, expected);
            for (k, v) in &model {
                assert_eq!(tree.find(cs, k).map(|e| e.value()), Some(v.as_slice()));
            }
            // one byte past the alphabet sorts after every stored key
            for k in all_keys(5, 3) {
                let lower = model.range(k.clone()..).next().map(|(k, _)| k.as_slice());
                assert_eq!(tree.lower_bound(cs, &k).map(|e| e.key()), lower);
                let upper = model
                    .range((Excluded(k.clone()), Unbounded))
                    .next()
                    .map(|(k, _)| k.as_slice());
                assert_eq!(tree.upper_bound(cs, &k).map(|e| e.key()), upper);
            }
            tree.node_counts(cs)
        });
        drop(w);

        prop_assert_eq!(counts.leaves, model.len());
        // every branch keeps at least two children
        prop_assert!(counts.min_branch_fanout.map_or(true, |fanout| fanout >= 2));
        prop_assert_eq!(counts.min_branch_fanout.is_some(), counts.branches > 0);
        if counts.leaves > 0 {
            prop_assert!(counts.branches < counts.leaves);
        }

        tree.garbage_collect_force().unwrap();
        prop_assert_eq!(tree.pending_count(), 0);
        prop_assert_eq!(pool.allocation_count(), 1 + counts.leaves + counts.branches);
    }
}
