use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::{
    coalesce_ranges, BlockDevice, CowBlockDevice, DiskIdentity, MemBaseImage, MemOverlayDb,
    OverlayConfig, OverlayStore,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

#[derive(Debug, Clone)]
enum Op {
    Write { index: u64, fill: u8 },
    Read { index: u64 },
    ReadMany { indices: Vec<u64> },
    Flush,
    Reopen,
}

const BLOCK_SIZE: usize = 8;
const MAX_BASE_BLOCKS: u64 = 24;
const MAX_OPS: usize = 64;

type Cow = CowBlockDevice<MemBaseImage, MemOverlayDb>;

fn index_strategy(base_blocks: u64) -> BoxedStrategy<u64> {
    // Past-the-end indices exercise growth beyond the base.
    (0..base_blocks + 4).boxed()
}

fn op_strategy(base_blocks: u64) -> BoxedStrategy<Op> {
    prop_oneof![
        6 => (index_strategy(base_blocks), any::<u8>())
            .prop_map(|(index, fill)| Op::Write { index, fill }),
        3 => index_strategy(base_blocks).prop_map(|index| Op::Read { index }),
        2 => prop::collection::vec(index_strategy(base_blocks), 0..8)
            .prop_map(|indices| Op::ReadMany { indices }),
        1 => Just(Op::Flush),
        1 => Just(Op::Reopen),
    ]
    .boxed()
}

fn scenario_strategy() -> BoxedStrategy<(usize, usize, Vec<Op>)> {
    (1..=MAX_BASE_BLOCKS, 0..BLOCK_SIZE, 1usize..=4)
        .prop_flat_map(|(base_blocks, tail, flush_threshold)| {
            // A non-zero tail makes the last base block partial.
            let tail = if tail == 0 { BLOCK_SIZE } else { tail };
            let base_len = (base_blocks as usize - 1) * BLOCK_SIZE + tail;
            (
                Just(base_len),
                Just(flush_threshold),
                prop::collection::vec(op_strategy(base_blocks), 0..MAX_OPS),
            )
        })
        .boxed()
}

fn make_base_pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

struct Model {
    base: Vec<u8>,
    overlay: BTreeMap<u64, Vec<u8>>,
}

impl Model {
    fn read(&self, index: u64) -> Option<Vec<u8>> {
        if let Some(data) = self.overlay.get(&index) {
            return Some(data.clone());
        }
        let start = index as usize * BLOCK_SIZE;
        if start >= self.base.len() {
            return None;
        }
        let end = (start + BLOCK_SIZE).min(self.base.len());
        let mut block = self.base[start..end].to_vec();
        block.resize(BLOCK_SIZE, 0);
        Some(block)
    }
}

async fn open_cow(base: MemBaseImage, db: Arc<MemOverlayDb>, flush_threshold: usize) -> Cow {
    let overlay = OverlayStore::open(
        db,
        DiskIdentity::new("vm-prop", "disk0").unwrap(),
        OverlayConfig::default()
            .with_block_size(BLOCK_SIZE)
            .with_flush_threshold(flush_threshold),
    )
    .await
    .unwrap();
    CowBlockDevice::new(base, overlay)
}

async fn run_ops(base: Vec<u8>, flush_threshold: usize, ops: &[Op]) -> TestCaseResult {
    let db = Arc::new(MemOverlayDb::new());
    let mut model = Model {
        base: base.clone(),
        overlay: BTreeMap::new(),
    };
    let mut cow = open_cow(MemBaseImage::new(base.clone()), db.clone(), flush_threshold).await;

    for op in ops {
        match op {
            Op::Write { index, fill } => {
                let data = vec![*fill; BLOCK_SIZE];
                cow.write_block(*index, &data).await.unwrap();
                model.overlay.insert(*index, data.clone());

                prop_assert_eq!(cow.read_block(*index).await.unwrap(), Some(data));
            }
            Op::Read { index } => {
                prop_assert_eq!(cow.read_block(*index).await.unwrap(), model.read(*index));
            }
            Op::ReadMany { indices } => {
                let got = cow.read_blocks(indices).await.unwrap();
                let expected: BTreeMap<u64, Vec<u8>> = indices
                    .iter()
                    .filter_map(|&index| model.read(index).map(|data| (index, data)))
                    .collect();
                prop_assert_eq!(got, expected);
            }
            Op::Flush => {
                cow.overlay().flush().await.unwrap();
                prop_assert_eq!(cow.overlay().buffered_len().unwrap(), 0);
            }
            Op::Reopen => {
                cow.close().await.unwrap();
                let (base, _) = cow.into_parts();
                cow = open_cow(base, db.clone(), flush_threshold).await;
            }
        }

        let modified: Vec<u64> = model.overlay.keys().copied().collect();
        prop_assert_eq!(cow.overlay().modified_blocks().await.unwrap(), modified);
    }

    prop_assert_eq!(cow.base().as_bytes(), base.as_slice());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_cow_device_matches_reference((base_len, flush_threshold, ops) in scenario_strategy(), seed in any::<u8>()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(run_ops(make_base_pattern(base_len, seed), flush_threshold, &ops))?;
    }

    #[test]
    fn prop_coalesced_ranges_cover_exactly_the_input(indices in prop::collection::vec(0u64..200, 0..64)) {
        let ranges = coalesce_ranges(&indices);

        let covered: BTreeSet<u64> = ranges.iter().flat_map(|r| r.start..=r.end).collect();
        let expected: BTreeSet<u64> = indices.iter().copied().collect();
        prop_assert_eq!(covered, expected);

        for pair in ranges.windows(2) {
            // Sorted, disjoint and never adjacent (adjacent ranges would have merged).
            prop_assert!(pair[0].end + 1 < pair[1].start);
        }
        for r in &ranges {
            prop_assert!(r.start <= r.end);
        }
    }
}
