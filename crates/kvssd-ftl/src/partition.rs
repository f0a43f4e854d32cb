use std::collections::{BTreeSet, VecDeque};

use kvssd_collections::BulkHeap;
use kvssd_types::Geometry;
use thiserror::Error;
use tracing::debug;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Partition {
    Data,
    Map,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("no free segment in {0:?} partition")]
    NoFreeSegment(Partition),
    #[error("map partition has no invalidated blocks to collect")]
    NoInvalidBlocks,
}

/// GC target: one block per parallel unit. For the data partition the units
/// may contribute blocks of different lines; the map partition always
/// returns one whole line.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct GcTarget {
    /// `blocks[unit]` = line id of the block that unit contributes.
    pub blocks: Vec<u32>,
    pub invalid_grains: u32,
}

/// The capability set the core uses to obtain and retire flash blocks. One
/// implementation is chosen per FTL instance.
pub trait BlockManager {
    fn partition_of(&self, line: u32) -> Partition;

    /// Dequeue one free block per parallel unit and assemble them into a
    /// segment (line). Non-reserve data segments additionally enter each
    /// unit's GC max-heap.
    fn get_segment(&mut self, part: Partition, reserve: bool) -> Option<u32>;

    /// Pick the most-invalidated block group. `exclude` shields the
    /// partition's open line from selection.
    fn get_gc_target(
        &mut self,
        part: Partition,
        exclude: Option<u32>,
    ) -> Result<GcTarget, PartitionError>;

    /// Return a cleaned segment's blocks to the free queues and drop it
    /// from the live-segment map.
    fn trim_segment(&mut self, part: Partition, line: u32);

    /// Return an unused reserve segment to the free pool.
    fn reserve_to_free(&mut self, part: Partition, line: u32);

    /// Swap reserves: hand the old reserve's blocks to the GC heaps and
    /// draw a fresh reserve segment.
    fn change_reserve(&mut self, part: Partition, old_reserve: u32) -> Option<u32>;

    /// Record invalidated grains against a block, keyed for GC-target
    /// selection.
    fn note_invalid(&mut self, line: u32, unit: u32, grains: u32);

    fn note_erase(&mut self, line: u32, unit: u32);

    /// Erase cycles a block has been through.
    fn erase_count(&self, line: u32, unit: u32) -> u32;

    fn free_count(&self, part: Partition) -> usize;

    /// Pages still writable in the partition: the free pool plus the open
    /// segment's remainder, which the caller supplies.
    fn remaining_pages(&self, part: Partition, open_used: u32) -> u32;

    fn is_gc_needed(&self, part: Partition) -> bool;

    /// Live data segments (segments not yet fully trimmed).
    fn live_segments(&self) -> usize;
}

#[derive(Clone, Copy, Default)]
struct BlockState {
    invalid_grains: u32,
    erase_cnt: u32,
    in_free: bool,
}

struct Side {
    /// Line-id range `[from, to)` owned by this partition.
    from: u32,
    to: u32,
    /// Per-unit FIFO of free blocks (line ids).
    free: Vec<VecDeque<u32>>,
    /// Per-unit max-heap of allocated blocks, keyed by invalid grains at
    /// selection time.
    heaps: Vec<BulkHeap<u32>>,
    now_assign: i64,
}

impl Side {
    fn max_assign(&self) -> i64 {
        i64::from(self.to - self.from)
    }
}

/// Partitioned block manager: the block pool split into DATA and MAP at
/// creation, each side with per-unit free FIFOs and GC heaps.
pub struct PartitionedBlockManager {
    units: u32,
    pgs_per_segment: u32,
    data: Side,
    map: Side,
    /// Indexed `line * units + unit`.
    blocks: Vec<BlockState>,
    /// Live data segments.
    seg_map: BTreeSet<u32>,
}

impl PartitionedBlockManager {
    /// Data lines occupy `[0, data_lines)`, map lines the rest.
    pub fn new(geom: &Geometry, data_lines: u32) -> Self {
        let units = geom.parallel_units();
        let tt = geom.tt_lines();
        assert!(data_lines > 0 && data_lines < tt);

        let make_side = |from: u32, to: u32| {
            let mut free: Vec<VecDeque<u32>> = (0..units).map(|_| VecDeque::new()).collect();
            for line in from..to {
                for q in free.iter_mut() {
                    q.push_back(line);
                }
            }
            Side {
                from,
                to,
                free,
                heaps: (0..units).map(|_| BulkHeap::new()).collect(),
                now_assign: 0,
            }
        };

        debug!(
            data = ?(0..data_lines),
            map = ?(data_lines..tt),
            units,
            "partitioned block pool"
        );

        PartitionedBlockManager {
            units,
            pgs_per_segment: geom.pgs_per_line(),
            data: make_side(0, data_lines),
            map: make_side(data_lines, tt),
            blocks: vec![BlockState::default(); (tt * units) as usize],
            seg_map: BTreeSet::new(),
        }
    }

    fn side(&self, part: Partition) -> &Side {
        match part {
            Partition::Data => &self.data,
            Partition::Map => &self.map,
        }
    }

    fn side_mut(&mut self, part: Partition) -> &mut Side {
        match part {
            Partition::Data => &mut self.data,
            Partition::Map => &mut self.map,
        }
    }

    fn block(&self, line: u32, unit: u32) -> &BlockState {
        &self.blocks[(line * self.units + unit) as usize]
    }

    fn block_mut(&mut self, line: u32, unit: u32) -> &mut BlockState {
        &mut self.blocks[(line * self.units + unit) as usize]
    }

    /// Mark the partition's blocks free at creation time.
    fn init_free_flags(&mut self) {
        for state in self.blocks.iter_mut() {
            state.in_free = true;
        }
    }

    pub fn create(geom: &Geometry, data_lines: u32) -> Self {
        let mut bm = Self::new(geom, data_lines);
        bm.init_free_flags();
        bm
    }

    fn release_blocks(&mut self, part: Partition, line: u32, expect_clean: bool) {
        let units = self.units;
        for unit in 0..units {
            if expect_clean {
                assert_eq!(
                    self.block(line, unit).invalid_grains,
                    0,
                    "reserve segment {line} carries invalidations"
                );
            }
            let state = self.block_mut(line, unit);
            state.invalid_grains = 0;
            state.in_free = true;
        }
        let side = self.side_mut(part);
        for q in side.free.iter_mut() {
            q.push_back(line);
        }
        side.now_assign -= 1;
        assert!(side.now_assign >= 0, "{part:?} partition under-assigned");
        if part == Partition::Data {
            self.seg_map.remove(&line);
        }
    }
}

impl BlockManager for PartitionedBlockManager {
    fn partition_of(&self, line: u32) -> Partition {
        if line < self.data.to {
            Partition::Data
        } else {
            Partition::Map
        }
    }

    fn get_segment(&mut self, part: Partition, reserve: bool) -> Option<u32> {
        let units = self.units;
        let side = self.side_mut(part);
        let line = *side.free[0].front()?;
        for q in side.free.iter_mut() {
            let got = q.pop_front().expect("unit FIFOs out of lockstep");
            assert_eq!(got, line, "unit FIFOs out of lockstep");
        }
        side.now_assign += 1;
        assert!(
            side.now_assign <= side.max_assign(),
            "{part:?} partition over-assigned"
        );
        if !reserve && part == Partition::Data {
            for heap in side.heaps.iter_mut() {
                heap.insert_append(line);
            }
        }
        for unit in 0..units {
            self.block_mut(line, unit).in_free = false;
        }
        if part == Partition::Data {
            self.seg_map.insert(line);
        }
        debug!(?part, line, reserve, "segment assigned");
        Some(line)
    }

    fn get_gc_target(
        &mut self,
        part: Partition,
        exclude: Option<u32>,
    ) -> Result<GcTarget, PartitionError> {
        let units = self.units as usize;
        let mut target = GcTarget::default();

        match part {
            Partition::Data => {
                for unit in 0..units {
                    // Snapshot the current invalidation counts, re-key the
                    // heap against them, then pop past blocks already freed
                    // through the victim-queue path or shielded by
                    // `exclude`.
                    let keys: Vec<(u32, u32, bool)> = self.data.heaps[unit]
                        .iter()
                        .map(|&line| {
                            let state = self.block(line, unit as u32);
                            (line, state.invalid_grains, state.in_free)
                        })
                        .collect();
                    let heap = &mut self.data.heaps[unit];
                    heap.construct_by(|&line| {
                        keys.iter()
                            .find(|(l, _, _)| *l == line)
                            .map(|&(_, k, _)| k)
                            .unwrap_or(0)
                    });
                    let (block, invalid) = loop {
                        let Some((invalid, line)) = heap.pop_max() else {
                            return Err(PartitionError::NoFreeSegment(part));
                        };
                        let stale = keys
                            .iter()
                            .find(|(l, _, _)| *l == line)
                            .map_or(true, |&(_, _, free)| free);
                        if stale || exclude == Some(line) {
                            continue;
                        }
                        break (line, invalid);
                    };
                    target.invalid_grains += invalid;
                    target.blocks.push(block);
                }
            }
            Partition::Map => {
                let (from, to) = (self.map.from, self.map.to);
                let mut best: Option<(u32, u32)> = None;
                for line in from..to {
                    if exclude == Some(line) || self.block(line, 0).in_free {
                        continue;
                    }
                    let invalid: u32 = (0..self.units)
                        .map(|u| self.block(line, u).invalid_grains)
                        .sum();
                    if best.map_or(true, |(_, b)| invalid > b) {
                        best = Some((line, invalid));
                    }
                }
                let (line, invalid) = best.ok_or(PartitionError::NoInvalidBlocks)?;
                if invalid == 0 {
                    return Err(PartitionError::NoInvalidBlocks);
                }
                target.blocks = vec![line; units];
                target.invalid_grains = invalid;
            }
        }
        debug!(?part, blocks = ?target.blocks, invalid = target.invalid_grains, "gc target");
        Ok(target)
    }

    fn trim_segment(&mut self, part: Partition, line: u32) {
        self.release_blocks(part, line, false);
        debug!(?part, line, "segment trimmed");
    }

    fn reserve_to_free(&mut self, part: Partition, line: u32) {
        self.release_blocks(part, line, true);
    }

    fn change_reserve(&mut self, part: Partition, old_reserve: u32) -> Option<u32> {
        let fresh = self.get_segment(part, true)?;
        if part == Partition::Data {
            for heap in self.data.heaps.iter_mut() {
                heap.insert_append(old_reserve);
            }
        }
        Some(fresh)
    }

    fn note_invalid(&mut self, line: u32, unit: u32, grains: u32) {
        self.block_mut(line, unit).invalid_grains += grains;
    }

    fn note_erase(&mut self, line: u32, unit: u32) {
        self.block_mut(line, unit).erase_cnt += 1;
    }

    fn erase_count(&self, line: u32, unit: u32) -> u32 {
        self.block(line, unit).erase_cnt
    }

    fn free_count(&self, part: Partition) -> usize {
        self.side(part).free[0].len()
    }

    fn remaining_pages(&self, part: Partition, open_used: u32) -> u32 {
        let per_segment = self.pgs_per_segment;
        let free = self.side(part).free[0].len() as u32 * per_segment;
        free + per_segment.saturating_sub(open_used)
    }

    fn is_gc_needed(&self, part: Partition) -> bool {
        self.side(part).free[0].is_empty()
    }

    fn live_segments(&self) -> usize {
        self.seg_map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> Geometry {
        Geometry::new(2, 2, 8, 8, 4).unwrap()
    }

    fn bm() -> PartitionedBlockManager {
        PartitionedBlockManager::create(&geom(), 6)
    }

    #[test]
    fn partition_ranges() {
        let bm = bm();
        assert_eq!(bm.partition_of(0), Partition::Data);
        assert_eq!(bm.partition_of(5), Partition::Data);
        assert_eq!(bm.partition_of(6), Partition::Map);
        assert_eq!(bm.free_count(Partition::Data), 6);
        assert_eq!(bm.free_count(Partition::Map), 2);
    }

    #[test]
    fn segments_assign_and_trim_round_trip() {
        let mut bm = bm();
        let a = bm.get_segment(Partition::Data, false).unwrap();
        let b = bm.get_segment(Partition::Data, false).unwrap();
        assert_ne!(a, b);
        assert_eq!(bm.free_count(Partition::Data), 4);
        assert_eq!(bm.live_segments(), 2);

        bm.trim_segment(Partition::Data, a);
        assert_eq!(bm.free_count(Partition::Data), 5);
        assert_eq!(bm.live_segments(), 1);
    }

    #[test]
    #[should_panic(expected = "under-assigned")]
    fn double_trim_aborts() {
        let mut bm = bm();
        let a = bm.get_segment(Partition::Map, false).unwrap();
        bm.trim_segment(Partition::Map, a);
        bm.trim_segment(Partition::Map, a);
    }

    #[test]
    fn data_gc_target_prefers_most_invalid() {
        let mut bm = bm();
        let a = bm.get_segment(Partition::Data, false).unwrap();
        let b = bm.get_segment(Partition::Data, false).unwrap();
        for unit in 0..4 {
            bm.note_invalid(a, unit, 2);
            bm.note_invalid(b, unit, 9);
        }
        let target = bm.get_gc_target(Partition::Data, None).unwrap();
        assert_eq!(target.blocks, vec![b; 4]);
        assert_eq!(target.invalid_grains, 36);
    }

    #[test]
    fn data_gc_target_skips_excluded_open_line() {
        let mut bm = bm();
        let a = bm.get_segment(Partition::Data, false).unwrap();
        let b = bm.get_segment(Partition::Data, false).unwrap();
        for unit in 0..4 {
            bm.note_invalid(a, unit, 1);
            bm.note_invalid(b, unit, 9);
        }
        let target = bm.get_gc_target(Partition::Data, Some(b)).unwrap();
        assert_eq!(target.blocks, vec![a; 4]);
    }

    #[test]
    fn map_gc_target_requires_invalidations() {
        let mut bm = bm();
        let m = bm.get_segment(Partition::Map, false).unwrap();
        assert_eq!(
            bm.get_gc_target(Partition::Map, None),
            Err(PartitionError::NoInvalidBlocks)
        );
        bm.note_invalid(m, 1, 4);
        let target = bm.get_gc_target(Partition::Map, None).unwrap();
        assert_eq!(target.blocks[0], m);
        assert_eq!(target.invalid_grains, 4);
    }

    #[test]
    fn reserve_swap_returns_fresh_segment() {
        let mut bm = bm();
        let reserve = bm.get_segment(Partition::Data, true).unwrap();
        let swapped = bm.change_reserve(Partition::Data, reserve).unwrap();
        assert_ne!(reserve, swapped);
        // The old reserve is now heap-visible for GC targeting.
        for unit in 0..4 {
            bm.note_invalid(reserve, unit, 3);
        }
        let target = bm.get_gc_target(Partition::Data, None).unwrap();
        assert_eq!(target.blocks, vec![reserve; 4]);
    }

    #[test]
    fn gc_needed_when_the_free_pool_drains() {
        let mut bm = bm();
        assert!(!bm.is_gc_needed(Partition::Map));
        let first = bm.get_segment(Partition::Map, false).unwrap();
        let _second = bm.get_segment(Partition::Map, true).unwrap();
        assert!(bm.is_gc_needed(Partition::Map));
        bm.trim_segment(Partition::Map, first);
        assert!(!bm.is_gc_needed(Partition::Map));
    }

    #[test]
    fn erase_counts_accumulate_per_block() {
        let mut bm = bm();
        let line = bm.get_segment(Partition::Data, false).unwrap();
        assert_eq!(bm.erase_count(line, 0), 0);
        bm.note_erase(line, 0);
        bm.note_erase(line, 0);
        bm.note_erase(line, 3);
        assert_eq!(bm.erase_count(line, 0), 2);
        assert_eq!(bm.erase_count(line, 3), 1);
        // Trimming frees the block but keeps its wear history.
        bm.trim_segment(Partition::Data, line);
        assert_eq!(bm.erase_count(line, 0), 2);
    }

    #[test]
    fn remaining_pages_counts_pool_and_open_segment() {
        let mut bm = bm();
        // 6 free data segments of 32 pages each.
        assert_eq!(bm.remaining_pages(Partition::Data, 0), 192);
        let _open = bm.get_segment(Partition::Data, false).unwrap();
        assert_eq!(bm.remaining_pages(Partition::Data, 12), 5 * 32 + 20);
    }

    #[test]
    fn unused_reserve_returns_to_the_free_pool() {
        let mut bm = bm();
        let reserve = bm.get_segment(Partition::Map, true).unwrap();
        assert_eq!(bm.free_count(Partition::Map), 1);
        bm.reserve_to_free(Partition::Map, reserve);
        assert_eq!(bm.free_count(Partition::Map), 2);
    }
}
