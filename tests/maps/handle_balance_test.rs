/*!
 * Handle Balance Property Tests
 *
 * Whatever sequence of operations runs, and whichever of them fail, every
 * handle the protocol acquires is given back before the operation returns.
 */

use crate::common::loaded_protocol;
use nested_maps::ebpf::SimOp;
use nix::errno::Errno;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Insert { key: u32, entries: Vec<(u32, u32)> },
    Lookup { key: u32, inner_key: u32 },
    Delete { key: u32 },
}

#[derive(Debug, Clone)]
struct Fault {
    op: SimOp,
    skip: usize,
}

fn op() -> impl Strategy<Value = Op> {
    // Small key space so operations hit each other's entries
    prop_oneof![
        (0u32..4, prop::collection::vec((0u32..4, any::<u32>()), 0..4))
            .prop_map(|(key, entries)| Op::Insert { key, entries }),
        (0u32..4, 0u32..4).prop_map(|(key, inner_key)| Op::Lookup { key, inner_key }),
        (0u32..4).prop_map(|key| Op::Delete { key }),
    ]
}

fn fault() -> impl Strategy<Value = Option<Fault>> {
    let op = prop_oneof![
        Just(SimOp::MapCreate),
        Just(SimOp::MapUpdate),
        Just(SimOp::MapLookup),
        Just(SimOp::MapDelete),
        Just(SimOp::MapGetFdById),
        Just(SimOp::MapInfo),
    ];
    prop::option::of((op, 0usize..3).prop_map(|(op, skip)| Fault { op, skip }))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn handles_balance_across_operations(ops in prop::collection::vec((op(), fault()), 1..24)) {
        let (kernel, mut protocol) = loaded_protocol();
        let baseline = kernel.open_fds();

        for (op, fault) in ops {
            if let Some(fault) = fault {
                kernel.inject_fault_after(fault.op, fault.skip, Errno::EIO);
            }

            let _ = match &op {
                Op::Insert { key, entries } => protocol.insert(*key, entries).map(drop),
                Op::Lookup { key, inner_key } => protocol.lookup(*key, *inner_key).map(drop),
                Op::Delete { key } => protocol.delete(*key),
            };

            prop_assert_eq!(kernel.open_fds(), baseline, "fd delta after {:?}", op);
            prop_assert_eq!(protocol.registry().outstanding(), 0, "handle delta after {:?}", op);
        }

        let snapshot = protocol.registry().ledger().snapshot();
        prop_assert_eq!(snapshot.acquired(), snapshot.released);
    }

    #[test]
    fn lookup_sees_last_insert(values in prop::collection::vec(any::<u32>(), 1..8)) {
        let (_kernel, mut protocol) = loaded_protocol();
        for value in &values {
            protocol.insert(42, &[(12, *value)]).unwrap();
        }
        prop_assert_eq!(protocol.lookup(42, 12).unwrap(), *values.last().unwrap());
    }
}
