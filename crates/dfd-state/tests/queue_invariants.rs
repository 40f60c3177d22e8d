//! Randomized invariants over the candidate queues (public API only):
//! the shared cap holds under arbitrary update/pop interleavings, pops
//! come out in non-increasing cost order per class, and no short path is
//! ever queued twice.

use dfd_state::FilesState;
use dfd_types::{CompressClass, FragRecord, MAX_QUEUE_LENGTH, ShortPath};
use proptest::prelude::*;
use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
enum Op {
    Update(Vec<(u16, f64, bool)>),
    Pop(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        proptest::collection::vec(
            (0_u16..400, 1.0_f64..20.0, proptest::bool::ANY),
            1..80
        )
        .prop_map(Op::Update),
        (1_u8..10).prop_map(Op::Pop),
    ]
}

fn record(id: u16, cost: f64, compressed: bool) -> FragRecord {
    FragRecord {
        short_path: ShortPath(format!("dir/file-{id}")),
        size: 4096 + u64::from(id) * 1000,
        class: if compressed {
            CompressClass::Compressed
        } else {
            CompressClass::Uncompressed
        },
        cost,
    }
}

fn t0() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn cap_holds_and_drain_is_ordered_and_unique(ops in proptest::collection::vec(op_strategy(), 1..30)) {
        let state = FilesState::new(t0());
        let mut popped: Vec<FragRecord> = Vec::new();

        for op in ops {
            match op {
                Op::Update(batch) => {
                    let records = batch
                        .into_iter()
                        .map(|(id, cost, compressed)| record(id, cost, compressed))
                        .collect();
                    state.update_files(records, None, t0());
                    let fill = state.queue_fill();
                    prop_assert!(fill <= 1.0 + 1e-12, "queue fill {fill} over cap");
                }
                Op::Pop(count) => {
                    for _ in 0..count {
                        if let Some(item) = state.pop_most_interesting() {
                            popped.push(item);
                        }
                    }
                }
            }
        }

        drop(popped);

        // Drain everything left. Supersession may have raised a path's
        // cost between updates, so ordering and uniqueness are asserted
        // over this uninterrupted final drain.
        let mut drained: Vec<FragRecord> = Vec::new();
        while let Some(item) = state.pop_most_interesting() {
            drained.push(item);
            prop_assert!(drained.len() <= MAX_QUEUE_LENGTH, "drained past the cap");
        }

        let mut last_cost = [f64::INFINITY; 2];
        let mut seen: HashSet<ShortPath> = HashSet::new();
        for item in &drained {
            let class = item.class.index();
            prop_assert!(
                item.cost <= last_cost[class] + 1e-12,
                "class {class} popped {} after {}",
                item.cost,
                last_cost[class]
            );
            last_cost[class] = item.cost;
            prop_assert!(
                seen.insert(item.short_path.clone()),
                "{} drained twice",
                item.short_path
            );
        }
    }
}
