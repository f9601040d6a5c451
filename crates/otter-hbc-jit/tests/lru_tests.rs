//! LRU pool ordering and handle stability.

use otter_hbc_jit::{LruHandle, LruPool};
use proptest::prelude::*;

#[test]
fn handles_survive_growth() {
    let mut pool = LruPool::new();
    let handles: Vec<LruHandle> = (0..1000u32).map(|i| pool.add(i)).collect();
    assert_eq!(pool.len(), 1000);
    for (i, &h) in handles.iter().enumerate() {
        assert_eq!(pool.get(h), Some(&(i as u32)));
    }
    assert_eq!(pool.least_recent(), Some(&0));
}

#[test]
fn least_recent_follows_mark_used() {
    let mut pool = LruPool::new();
    let a = pool.add(10);
    let b = pool.add(20);
    let c = pool.add(30);
    assert_eq!(pool.iter().copied().collect::<Vec<_>>(), vec![10, 20, 30]);

    pool.mark_used(a);
    assert_eq!(pool.least_recent(), Some(&20));
    pool.mark_used(b);
    assert_eq!(pool.least_recent(), Some(&30));
    pool.mark_used(b);
    assert_eq!(pool.iter().copied().collect::<Vec<_>>(), vec![30, 10, 20]);

    assert_eq!(pool.remove(c), Some(30));
    assert_eq!(pool.remove(c), None);
    assert_eq!(pool.least_recent(), Some(&10));
}

#[derive(Debug, Clone)]
enum Op {
    Add,
    Use(usize),
    Remove(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Add),
        2 => any::<usize>().prop_map(Op::Use),
        1 => any::<usize>().prop_map(Op::Remove),
    ]
}

proptest! {
    /// The pool agrees with a plain vector kept in use order.
    #[test]
    fn matches_vec_model(ops in prop::collection::vec(op(), 0..300)) {
        let mut pool = LruPool::new();
        let mut model: Vec<(u32, LruHandle)> = Vec::new();
        let mut next = 0u32;

        for op in ops {
            match op {
                Op::Add => {
                    let h = pool.add(next);
                    model.push((next, h));
                    next += 1;
                }
                Op::Use(i) if !model.is_empty() => {
                    let entry = model.remove(i % model.len());
                    pool.mark_used(entry.1);
                    model.push(entry);
                }
                Op::Remove(i) if !model.is_empty() => {
                    let (value, h) = model.remove(i % model.len());
                    prop_assert_eq!(pool.remove(h), Some(value));
                }
                _ => {}
            }
            prop_assert_eq!(pool.len(), model.len());
            prop_assert_eq!(pool.least_recent(), model.first().map(|(v, _)| v));
        }

        let order: Vec<u32> = pool.iter().copied().collect();
        let expected: Vec<u32> = model.iter().map(|(v, _)| *v).collect();
        prop_assert_eq!(order, expected);
        for (value, h) in &model {
            prop_assert_eq!(pool.get(*h), Some(value));
        }
    }
}
