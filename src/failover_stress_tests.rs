use crate::config::{ArenaConfig, CbsConfig, PoolConfig};
use crate::land::{ranges, Cbs, Failover, FindDelete, Freelist, Land};
use crate::pool::MvffPool;
use crate::range::Range;
use quickcheck::quickcheck;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

const ALIGN: usize = 8;
const UNITS: usize = 2048;

/// Mark every unit `land` holds, failing on a unit held twice
fn held_units(land: &dyn Land) -> Vec<bool> {
    let mut held = vec![false; UNITS];
    for range in ranges(land) {
        for unit in range.base() / ALIGN..range.limit() / ALIGN {
            assert!(!held[unit], "unit {unit} held twice");
            held[unit] = true;
        }
    }
    held
}

fn unit_range(first: usize, count: usize) -> Range {
    Range::with_size(first * ALIGN, count * ALIGN)
}

#[cfg(test)]
mod stress_tests {
    use super::*;

    fn run_workload(seed: u64, node_limit: usize, ops: usize) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut primary = Cbs::new(
            CbsConfig::default()
                .with_alignment(ALIGN)
                .with_extend_by(1)
                .with_node_limit(node_limit),
        );
        let mut secondary = Freelist::new(ALIGN);
        let mut fo = Failover::new(&mut primary, &mut secondary, ALIGN).unwrap();
        let mut model = vec![false; UNITS];

        for op in 0..ops {
            match rng.gen_range(0..4) {
                0 | 1 => {
                    let first = rng.gen_range(0..UNITS - 1);
                    let count = rng.gen_range(1..=16).min(UNITS - first);
                    if model[first..first + count].iter().any(|&free| free) {
                        continue;
                    }
                    let range = unit_range(first, count);
                    let merged = fo.insert(range).unwrap();
                    assert!(merged.nests(&range));
                    model[first..first + count].fill(true);
                }
                2 => {
                    let blocks = ranges(&fo);
                    if blocks.is_empty() {
                        continue;
                    }
                    let block = blocks[rng.gen_range(0..blocks.len())];
                    let units = block.size() / ALIGN;
                    let offset = rng.gen_range(0..units);
                    let count = rng.gen_range(1..=units - offset);
                    let first = block.base() / ALIGN + offset;
                    let range = unit_range(first, count);

                    let old = fo.delete(range).unwrap();
                    assert!(old.nests(&range));
                    model[first..first + count].fill(false);
                }
                _ => {
                    let size = rng.gen_range(1..=8) * ALIGN;
                    if let Some(found) = fo.find_first(size, FindDelete::Low) {
                        assert_eq!(found.range.size(), size);
                        let first = found.range.base() / ALIGN;
                        let count = size / ALIGN;
                        assert!(model[first..first + count].iter().all(|&free| free));
                        model[first..first + count].fill(false);
                    } else {
                        assert!(ranges(&fo).iter().all(|r| r.size() < size));
                    }
                }
            }

            if op % 64 == 0 {
                fo.check().unwrap();
            }
            assert_eq!(held_units(&fo), model, "divergence after op {op}");
        }

        let model_size = model.iter().filter(|&&free| free).count() * ALIGN;
        assert_eq!(fo.size(), model_size);
        fo.check().unwrap();
    }

    #[test]
    fn stress_test_starved_primary() {
        run_workload(0x5eed, 2, 3000);
    }

    #[test]
    fn stress_test_roomy_primary() {
        run_workload(42, 64, 3000);
    }

    #[test]
    fn stress_test_many_seeds() {
        for seed in 0..16 {
            run_workload(seed, 1 + (seed as usize % 4), 500);
        }
    }

    #[test]
    fn stress_test_pool_alloc_free() {
        let config = PoolConfig::default()
            .with_extend_by(0x4000)
            .with_spare(0.5)
            .with_cbs(CbsConfig::default().with_extend_by(1).with_node_limit(4));
        let arena = ArenaConfig::default()
            .with_base(0x100_0000)
            .with_reserve(0x100_0000)
            .with_grain(0x1000)
            .with_zone_shift(20);
        let mut pool = MvffPool::with_arena_config(config, arena).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut live: HashMap<usize, Range> = HashMap::new();

        for i in 0..4000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let range = pool.alloc(rng.gen_range(1..=512)).unwrap();
                assert!(live.values().all(|other| !other.overlaps(&range)));
                live.insert(i, range);
            } else {
                let key = *live.keys().nth(rng.gen_range(0..live.len())).unwrap();
                let range = live.remove(&key).unwrap();
                pool.free(range).unwrap();
            }

            let in_use: usize = live.values().map(Range::size).sum();
            assert_eq!(pool.size(), pool.free_size() + in_use);
        }
        pool.check().unwrap();

        for (_, range) in live.drain() {
            pool.free(range).unwrap();
        }
        assert_eq!(pool.free_size(), pool.size());
        pool.check().unwrap();
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;

    quickcheck! {
        fn prop_insert_delete_conserves(sizes: Vec<u8>) -> bool {
            let mut primary = Cbs::new(
                CbsConfig::default().with_alignment(ALIGN).with_extend_by(1).with_node_limit(2),
            );
            let mut secondary = Freelist::new(ALIGN);
            let mut fo = Failover::new(&mut primary, &mut secondary, ALIGN).unwrap();

            // Each range sits in its own slot with a gap after it.
            let inserted: Vec<Range> = sizes
                .iter()
                .take(UNITS / 32)
                .enumerate()
                .map(|(i, &units)| unit_range(i * 32, units as usize % 31 + 1))
                .collect();
            for range in &inserted {
                if fo.insert(*range).is_err() {
                    return false;
                }
            }
            let expected: usize = inserted.iter().map(Range::size).sum();
            if fo.size() != expected || fo.check().is_err() {
                return false;
            }
            for range in &inserted {
                if fo.delete(*range) != Ok(*range) {
                    return false;
                }
            }
            fo.size() == 0 && ranges(&fo).is_empty()
        }

        fn prop_split_deletes_survive_starvation(cuts: Vec<u8>) -> bool {
            let mut primary = Cbs::new(CbsConfig::default().with_alignment(ALIGN));
            let mut secondary = Freelist::new(ALIGN);
            let whole = unit_range(0, 512);
            if primary.insert(whole).is_err() {
                return false;
            }
            primary.node_pool_mut().starve();
            let mut fo = Failover::new(&mut primary, &mut secondary, ALIGN).unwrap();

            let mut cuts: Vec<usize> = cuts.into_iter().map(usize::from).collect();
            cuts.sort_unstable();
            cuts.dedup();
            let mut remaining = whole.size();
            for unit in cuts {
                // Cuts are one unit wide at even units so they never touch.
                let range = unit_range(unit * 2, 1);
                match fo.delete(range) {
                    Ok(old) if old.nests(&range) => remaining -= range.size(),
                    _ => return false,
                }
                if fo.size() != remaining {
                    return false;
                }
            }
            fo.check().is_ok() && held_units(&fo).iter().filter(|&&h| h).count() * ALIGN == remaining
        }
    }
}
