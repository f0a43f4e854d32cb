use std::collections::VecDeque;

use kvssd_media::{FlashMedia, NandOp, NandOpKind, NandTiming, PcieLatency};
use kvssd_types::{
    GrainAddr, Key, KvRecord, Lpa, Ppa, EPP, FP_MAX, GRAIN_PER_PAGE, GRAIN_SIZE, OOB_INV_MAPPING,
    OOB_TOMBSTONE, PAGE_SIZE,
};
use tracing::{debug, trace, warn};

use crate::cache::{Cmt, CmtState, PtEntry, NO_TPAGE};
use crate::config::{ConfigError, FtlConfig};
use crate::device::{Reply, ValueSource};
use crate::error::{KvError, Result};
use crate::hash::HashMeta;
use crate::invlog::InvMappingLog;
use crate::lines::{IoStream, LineManager, OutOfLines};
use crate::oob::{GrainBitmap, OobTable};
use crate::partition::{BlockManager, Partition, PartitionedBlockManager};
use crate::stats::{Rw, Stats};
use crate::wb::{DedupTable, WriteBuffer};

/// Suspension label stored on a deferred request. A request observed with a
/// label other than `None` resumes at exactly that stage.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Jump {
    #[default]
    None,
    Load,
    List,
    Evict,
    Complete,
    Read,
    Update,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageState {
    Free,
    Valid,
    Invalid,
}

/// What caused a mapping-page access, for the statistics split.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum OpCause {
    Read,
    Write,
    Gc,
}

pub(crate) enum Waiter {
    Read,
    WbSlot(usize),
}

/// Who a freshly-written map-stream page belongs to; consulted by map GC
/// for liveness.
#[derive(Clone, Copy, Debug)]
pub(crate) enum MapPageOwner {
    /// Translation page of this chunk index.
    Translation(u32),
    /// Invalid-mapping log page describing this data line.
    InvLog(u32),
}

pub(crate) enum LoadOutcome {
    /// The chunk has never been written: nothing to load.
    NoTranslation,
    /// A mapping read was issued; completion parked on the entry.
    Issued(u64),
    /// Another load for this chunk is in flight; the waiter was parked on
    /// the entry's retry queue.
    Deferred,
}

/// One write-buffer entry travelling through the flush pipeline.
pub(crate) struct FlushSlot {
    pub key: Key,
    pub grains: u32,
    pub hash: HashMeta,
    pub pga: GrainAddr,
    pub jump: Jump,
}

struct FlowControl {
    write_credits: i64,
    credits_to_refill: u32,
}

/// One FTL shard: the demand-cached mapping, log-structured allocator, write
/// buffer and garbage collector over one flash medium.
pub struct DemandShard {
    pub(crate) cfg: FtlConfig,
    pub(crate) media: Box<dyn FlashMedia>,
    pub(crate) nand: Box<dyn NandTiming>,
    pub(crate) pcie: PcieLatency,
    pub(crate) bpm: Box<dyn BlockManager>,
    pub(crate) lines: LineManager,
    pub(crate) pages: Vec<PageState>,
    pub(crate) oob: OobTable,
    pub(crate) bitmap: GrainBitmap,
    pub(crate) cmt: Cmt,
    wb: WriteBuffer,
    pub(crate) dedup: DedupTable,
    pub(crate) stats: Stats,
    flow: FlowControl,
    pub(crate) inv_log: Option<InvMappingLog>,
    pub(crate) map_reserve: u32,
    max_try: u32,
    space_used: u64,
    clock: u64,
}

impl DemandShard {
    pub fn new(
        cfg: FtlConfig,
        media: Box<dyn FlashMedia>,
        nand: Box<dyn NandTiming>,
    ) -> std::result::Result<Self, ConfigError> {
        cfg.validate()?;
        let geom = cfg.geometry;
        assert!(
            media.capacity_bytes() >= geom.flash_bytes(),
            "medium smaller than the geometry"
        );

        let mut bpm: Box<dyn BlockManager> =
            Box::new(PartitionedBlockManager::create(&geom, cfg.data_lines()));
        let user_line = bpm.get_segment(Partition::Data, false).unwrap();
        let gc_line = bpm.get_segment(Partition::Data, true).unwrap();
        let map_line = bpm.get_segment(Partition::Map, false).unwrap();
        let map_reserve = bpm.get_segment(Partition::Map, true).unwrap();

        let grains_per_line = geom.grains_per_line();
        debug!(
            tt_pgs = geom.tt_pgs(),
            data_lines = cfg.data_lines(),
            map_lines = cfg.map_lines(),
            tpages = cfg.nr_valid_tpages(),
            "demand shard created"
        );

        Ok(DemandShard {
            media,
            nand,
            pcie: PcieLatency::default(),
            bpm,
            lines: LineManager::new(geom, cfg.data_lines(), user_line, map_line, gc_line),
            pages: vec![PageState::Free; geom.tt_pgs() as usize],
            oob: OobTable::new(geom.tt_pgs()),
            bitmap: GrainBitmap::new(geom.tt_grains()),
            cmt: Cmt::new(cfg.nr_valid_tpages(), cfg.max_cached_tpages),
            wb: WriteBuffer::new(cfg.wb_flush_size),
            dedup: DedupTable::default(),
            stats: Stats::default(),
            flow: FlowControl {
                write_credits: i64::from(grains_per_line),
                credits_to_refill: grains_per_line,
            },
            inv_log: cfg
                .inv_mapping_log
                .then(|| InvMappingLog::new(cfg.data_lines())),
            map_reserve,
            max_try: 0,
            space_used: 0,
            clock: 0,
            cfg,
        })
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1_000;
        self.clock
    }

    // ---- media + timing helpers -------------------------------------------

    pub(crate) fn nand_read_page(&mut self, page: Ppa, stime: u64) -> (Vec<u8>, u64) {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.media
            .read_at(u64::from(page) * PAGE_SIZE as u64, &mut buf)
            .expect("flash read out of range");
        let ns = self.nand.advance(&NandOp {
            kind: NandOpKind::Read,
            target: self.cfg.geometry.ppa_parts(page),
            xfer_bytes: PAGE_SIZE,
            stime,
        });
        (buf, ns)
    }

    pub(crate) fn nand_write_page(&mut self, page: Ppa, bytes: &[u8], stime: u64) -> u64 {
        debug_assert_eq!(bytes.len(), PAGE_SIZE);
        self.media
            .write_at(u64::from(page) * PAGE_SIZE as u64, bytes)
            .expect("flash write out of range");
        self.nand.advance(&NandOp {
            kind: NandOpKind::Write,
            target: self.cfg.geometry.ppa_parts(page),
            xfer_bytes: PAGE_SIZE,
            stime,
        })
    }

    // ---- page and grain state ---------------------------------------------

    pub(crate) fn mark_page_valid(&mut self, page: Ppa) {
        assert_eq!(
            self.pages[page as usize],
            PageState::Free,
            "page {page} re-written before erase"
        );
        self.pages[page as usize] = PageState::Valid;
    }

    fn mark_page_invalid(&mut self, page: Ppa) {
        assert_eq!(self.pages[page as usize], PageState::Valid);
        self.pages[page as usize] = PageState::Invalid;
        trace!(page, "page fully invalidated");
    }

    /// Erase-time reset: the page returns to the free state and its OOB
    /// words are cleared.
    pub(crate) fn reset_page(&mut self, page: Ppa) {
        self.pages[page as usize] = PageState::Free;
        self.oob.reset_page(page);
    }

    pub(crate) fn mark_grain_valid(&mut self, grain: GrainAddr, len: usize) {
        let page = grain.page();
        assert_eq!(self.pages[page as usize], PageState::Valid);
        self.bitmap.set_valid(grain, len);
        self.lines.add_valid(page, len as u32);
    }

    pub(crate) fn mark_grain_invalid(&mut self, grain: GrainAddr, len: usize) {
        let page = grain.page();
        assert_ne!(self.pages[page as usize], PageState::Free);
        self.bitmap.clear_valid(grain, len);
        self.lines.add_invalid(page, len as u32);

        let parts = self.cfg.geometry.ppa_parts(page);
        let unit = parts.ch * self.cfg.geometry.luns_per_ch + parts.lun;
        self.bpm.note_invalid(parts.blk, unit, len as u32);

        if self.bitmap.page_all_invalid(page) {
            self.mark_page_invalid(page);
        }
    }

    // ---- allocation -------------------------------------------------------

    fn new_user_page(&mut self) -> Ppa {
        let page = self.lines.next_page(IoStream::User);
        self.lines
            .advance(IoStream::User, || {
                self.bpm.get_segment(Partition::Data, false)
            })
            .expect("user write pointer unable to advance");
        self.mark_page_valid(page);
        page
    }

    pub(crate) fn new_gc_page(&mut self) -> Ppa {
        let page = self.lines.next_page(IoStream::Gc);
        self.lines
            .advance(IoStream::Gc, || self.bpm.get_segment(Partition::Data, true))
            .expect("gc write pointer unable to advance");
        self.mark_page_valid(page);
        page
    }

    /// Write one map-stream page: allocate at the cursor, tag the OOB,
    /// register the owner, push the image, then advance. Registration must
    /// precede the advance — a rollover can start a map-GC cycle, and the
    /// collector decides liveness from the owner back-pointers.
    pub(crate) fn write_map_page(
        &mut self,
        image: &[u8],
        owner: MapPageOwner,
        stime: u64,
    ) -> (Ppa, u64) {
        let page = self.lines.next_page(IoStream::Map);
        self.mark_page_valid(page);
        self.mark_grain_valid(GrainAddr::new(page, 0), GRAIN_PER_PAGE);
        match owner {
            MapPageOwner::Translation(idx) => {
                self.oob.set(page, 0, u64::from(idx) * EPP as u64);
                self.cmt.entry_mut(idx).t_ppa = page;
            }
            MapPageOwner::InvLog(line) => {
                self.oob.set(page, 0, OOB_INV_MAPPING);
                self.oob.set(page, 1, (u64::from(line) << 32) | u64::from(page));
                self.inv_log
                    .as_mut()
                    .expect("log page without the log enabled")
                    .note_flushed(page, line);
            }
        }
        let ns = self.nand_write_page(page, image, stime);
        match self
            .lines
            .advance(IoStream::Map, || self.bpm.get_segment(Partition::Map, false))
        {
            Ok(()) => {}
            Err(OutOfLines) => self.do_map_gc(stime),
        }
        (page, ns)
    }

    // ---- translation cache machinery --------------------------------------

    pub(crate) fn cache_load(&mut self, lpa: Lpa, waiter: Waiter, stime: u64) -> LoadOutcome {
        let idx = Cmt::idx_of(lpa);
        if self.cmt.entry(idx).is_flying {
            match waiter {
                Waiter::WbSlot(slot) => {
                    self.cmt.entry_mut(idx).retry_q.push_back(slot);
                    return LoadOutcome::Deferred;
                }
                // Flights resolve within the pipeline that started them;
                // a read can never observe one.
                Waiter::Read => unreachable!("mapping read in flight outside the pipeline"),
            }
        }

        let t_ppa = self.cmt.entry(idx).t_ppa;
        if t_ppa == NO_TPAGE {
            return LoadOutcome::NoTranslation;
        }

        let (buf, ns) = self.nand_read_page(t_ppa, stime);
        self.stats.trans_r += 1;
        match waiter {
            Waiter::Read => self.stats.t_read_on_read += 1,
            Waiter::WbSlot(_) => self.stats.t_read_on_write += 1,
        }
        let entry = self.cmt.entry_mut(idx);
        entry.flying_buf = Some(buf);
        entry.is_flying = true;
        trace!(lpa, idx, t_ppa, "mapping read issued");
        LoadOutcome::Issued(ns)
    }

    /// Install the translation page for `lpa`'s chunk, evicting the LRU
    /// tail first when the cache is at capacity. Returns whether a dirty
    /// eviction write was issued, the completion timestamp, and the
    /// write-buffer slots freed from the chunk's retry queue.
    pub(crate) fn cache_list_up(
        &mut self,
        lpa: Lpa,
        stime: u64,
        credits: &mut u32,
        cause: OpCause,
    ) -> (bool, u64, Vec<usize>) {
        let idx = Cmt::idx_of(lpa);
        let mut ns_latest = stime;
        let mut evicted_dirty = false;

        if self.cmt.is_full() {
            let vidx = self.cmt.pop_lru_victim();
            assert_ne!(vidx, idx, "evicting the chunk being installed");
            assert!(!self.cmt.entry(vidx).is_flying);

            if self.cmt.entry(vidx).state == CmtState::Dirty {
                self.stats.dirty_evict += 1;

                // The superseded on-flash copy (if any) dies now, before the
                // new page is committed.
                let old_t_ppa = self.cmt.entry(vidx).t_ppa;
                if old_t_ppa != NO_TPAGE {
                    self.mark_grain_invalid(GrainAddr::new(old_t_ppa, 0), GRAIN_PER_PAGE);
                }

                let image = {
                    let victim = self.cmt.entry(vidx);
                    Cmt::pt_to_page(victim.pt.as_ref().unwrap())
                };
                let (new_ppa, ns) =
                    self.write_map_page(&image, MapPageOwner::Translation(vidx), stime);
                ns_latest = ns_latest.max(ns);
                self.stats.trans_w += 1;
                match cause {
                    OpCause::Read => self.stats.t_write_on_read += 1,
                    OpCause::Write => self.stats.t_write_on_write += 1,
                    OpCause::Gc => self.stats.trans_w_dgc += 1,
                }

                self.cmt.entry_mut(vidx).state = CmtState::Clean;
                *credits += GRAIN_PER_PAGE as u32;
                evicted_dirty = true;
                debug!(victim = vidx, new_ppa, "dirty translation page written back");
            } else {
                self.stats.clean_evict += 1;
            }
            self.cmt.drop_resident(vidx);
        }

        // Materialize the chunk: from the just-read page, or zeroed for a
        // chunk that has never been written.
        let entry = self.cmt.entry_mut(idx);
        if entry.is_flying {
            entry.is_flying = false;
            let buf = entry.flying_buf.take().expect("flying without a buffer");
            entry.pt = Some(Cmt::page_to_pt(&buf));
        } else if entry.pt.is_none() {
            entry.pt = Some(Cmt::fresh_pt());
        }
        let freed: Vec<usize> = self.cmt.entry_mut(idx).retry_q.drain(..).collect();
        self.cmt.install(idx);

        (evicted_dirty, ns_latest, freed)
    }

    // ---- credits ----------------------------------------------------------

    pub(crate) fn consume_write_credit(&mut self, len: u32) {
        self.flow.write_credits -= i64::from(len);
        trace!(
            consumed = len,
            remaining = self.flow.write_credits,
            "write credits consumed"
        );
    }

    pub(crate) fn check_and_refill_write_credit(&mut self, stime: u64) {
        if self.flow.write_credits <= 0 {
            self.foreground_gc(stime);
            self.flow.write_credits += i64::from(self.flow.credits_to_refill);
        }
    }

    fn foreground_gc(&mut self, stime: u64) {
        if self.bpm.free_count(Partition::Data) <= self.cfg.gc_thres_lines as usize {
            self.do_gc(true, stime);
        } else {
            trace!("credit refill without GC: free lines above threshold");
        }
    }

    pub(crate) fn set_refill(&mut self, grains: u32) {
        self.flow.credits_to_refill = grains;
    }

    // ---- store ------------------------------------------------------------

    pub fn store(&mut self, key: Key, value: &[u8]) -> Result<Reply> {
        if value.is_empty() || value.len() % 4 != 0 {
            return Err(KvError::BadValueLength);
        }
        if KvRecord::encoded_len(&key, value.len()) > PAGE_SIZE {
            return Err(KvError::ValueTooLarge);
        }

        let stime = self.tick();
        let _displaced = self.wb.insert(key, value.to_vec());
        let mut nsecs = stime + 1;
        if self.wb.is_full() {
            nsecs = nsecs.max(self.flush_write_buffer(stime));
        }
        Ok(Reply {
            nsecs,
            value: None,
            source: ValueSource::WriteBuffer,
        })
    }

    /// Drain and flush the write buffer: assign grains, update the mapping,
    /// push the packed pages to flash.
    pub fn flush_write_buffer(&mut self, stime: u64) -> u64 {
        let drained = self.wb.drain();
        if drained.is_empty() {
            return stime;
        }

        let mut credits: u32 = 0;
        let (flush_list, mut slots) = self.wb_assign_ppa(drained);
        let ns_map = self.wb_mapping_update(&mut slots, &mut credits, stime);
        let ns_data = self.wb_flush_pages(flush_list, &mut credits, stime);

        self.dedup.clear();
        self.consume_write_credit(credits);
        self.check_and_refill_write_credit(stime);
        ns_map.max(ns_data)
    }

    /// Stage A: bucket by grain length and greedily pack user-stream pages,
    /// longest pairs first. Residual tail grains are marked valid then
    /// invalid and tagged with the tombstone.
    fn wb_assign_ppa(
        &mut self,
        drained: Vec<(Key, crate::wb::WbEntry)>,
    ) -> (Vec<(Ppa, Vec<u8>)>, Vec<FlushSlot>) {
        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); GRAIN_PER_PAGE + 1];
        for (i, (_, entry)) in drained.iter().enumerate() {
            buckets[entry.grains as usize].push(i);
        }

        let mut slots = Vec::with_capacity(drained.len());
        let mut flush_list = Vec::new();
        let mut placed = 0;

        while placed < drained.len() {
            let page = self.new_user_page();
            let mut image = vec![0u8; PAGE_SIZE];
            let mut offset = 0usize;

            loop {
                let remain = GRAIN_PER_PAGE - offset;
                if remain == 0 {
                    break;
                }
                let mut target = remain;
                while target > 0 && buckets[target].is_empty() {
                    target -= 1;
                }
                if target == 0 {
                    break;
                }

                let i = buckets[target].pop().unwrap();
                let (key, entry) = &drained[i];
                let pga = GrainAddr::new(page, offset);
                KvRecord::encode_into(key, &entry.value, &mut image[offset * GRAIN_SIZE..]);
                self.mark_grain_valid(pga, target);
                slots.push(FlushSlot {
                    key: *key,
                    grains: target as u32,
                    hash: entry.hash,
                    pga,
                    jump: Jump::None,
                });
                trace!(key = ?key, ?pga, grains = target, "pair packed");
                offset += target;
                placed += 1;
            }

            if offset < GRAIN_PER_PAGE {
                let pad = GRAIN_PER_PAGE - offset;
                let pga = GrainAddr::new(page, offset);
                self.mark_grain_valid(pga, pad);
                self.mark_grain_invalid(pga, pad);
                self.oob.set(page, offset, OOB_TOMBSTONE);
                debug!(page, pad, "tail grains padded");
            }

            flush_list.push((page, image));
        }

        (flush_list, slots)
    }

    /// Stage B: drive every slot through the mapping-update machine until
    /// all are installed. Deferred slots resume at their stored label.
    fn wb_mapping_update(
        &mut self,
        slots: &mut [FlushSlot],
        credits: &mut u32,
        stime: u64,
    ) -> u64 {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Stage {
            Begin,
            Load,
            ListUp,
            DataCheck,
            Update,
        }

        let n = slots.len();
        let nr_entries = self.cfg.nr_valid_tentries();
        let mut master: VecDeque<usize> = (0..n).collect();
        let mut retry: VecDeque<usize> = VecDeque::new();
        let mut updated = 0;
        let mut ns_latest = stime;

        while updated < n {
            let Some(slot) = retry.pop_front().or_else(|| master.pop_front()) else {
                panic!("write-buffer entries lost from the update queues");
            };

            let mut stage = match std::mem::take(&mut slots[slot].jump) {
                Jump::None => Stage::Begin,
                Jump::Load => Stage::Load,
                Jump::List | Jump::Evict => Stage::ListUp,
                Jump::Complete => Stage::DataCheck,
                Jump::Update => Stage::Update,
                Jump::Read => unreachable!("read label on a write-buffer entry"),
            };

            'machine: loop {
                let lpa = slots[slot].hash.lpa(nr_entries);
                match stage {
                    Stage::Begin => {
                        if self.cmt.is_hit(lpa) {
                            self.cmt.touch(lpa);
                            stage = Stage::DataCheck;
                        } else if self.cmt.entry(Cmt::idx_of(lpa)).is_flying {
                            // wait_if_flying: park until the in-flight load
                            // lists up.
                            self.cmt
                                .entry_mut(Cmt::idx_of(lpa))
                                .retry_q
                                .push_back(slot);
                            break 'machine;
                        } else {
                            stage = Stage::Load;
                        }
                    }
                    Stage::Load => match self.cache_load(lpa, Waiter::WbSlot(slot), stime) {
                        LoadOutcome::NoTranslation => stage = Stage::ListUp,
                        LoadOutcome::Issued(ns) => {
                            ns_latest = ns_latest.max(ns);
                            slots[slot].jump = Jump::List;
                            retry.push_back(slot);
                            break 'machine;
                        }
                        LoadOutcome::Deferred => break 'machine,
                    },
                    Stage::ListUp => {
                        let (dirty, ns, freed) =
                            self.cache_list_up(lpa, stime, credits, OpCause::Write);
                        ns_latest = ns_latest.max(ns);
                        for d in freed {
                            slots[d].jump = Jump::Complete;
                            retry.push_back(d);
                        }
                        if dirty {
                            // The eviction write must land before this entry
                            // proceeds.
                            slots[slot].jump = Jump::Complete;
                            retry.push_back(slot);
                            break 'machine;
                        }
                        stage = Stage::DataCheck;
                    }
                    Stage::DataCheck => {
                        if !self.cmt.is_hit(lpa) {
                            // The chunk was evicted again while this entry
                            // sat deferred; fault it back in.
                            stage = Stage::Begin;
                            continue;
                        }
                        let pte = self.cmt.get_pte(lpa);
                        if pte.ppa.is_invalid() {
                            // A tombstone may only be reused by the key it
                            // belongs to; reuse by another key would orphan
                            // that key's deeper probe chain. Without the
                            // fingerprint compare ownership is unknowable,
                            // so every tombstone is stepped past.
                            let reusable = pte.fp == FP_MAX
                                || (self.cfg.store_key_fp && pte.fp == slots[slot].hash.fp);
                            if !reusable {
                                slots[slot].hash.cnt += 1;
                                stage = Stage::Begin;
                                continue;
                            }
                            // Direct insert: nothing to verify.
                            stage = Stage::Update;
                            continue;
                        }
                        if self.cfg.store_key_fp && pte.fp != slots[slot].hash.fp {
                            slots[slot].hash.cnt += 1;
                            stage = Stage::Begin;
                            continue;
                        }
                        if self.dedup.contains(pte.ppa) {
                            // The grains behind this address were superseded
                            // within this flush; a read would verify stale
                            // bytes.
                            slots[slot].hash.cnt += 1;
                            stage = Stage::Begin;
                            continue;
                        }

                        let (buf, ns) = self.nand_read_page(pte.ppa.page(), stime);
                        self.stats.data_r += 1;
                        self.stats.d_read_on_write += 1;
                        ns_latest = ns_latest.max(ns);

                        let stored = KvRecord::decode_key(&buf[pte.ppa.offset() * GRAIN_SIZE..])
                            .expect("mapped grain holds no record");
                        if stored == slots[slot].key.as_bytes() {
                            self.stats.fp_match_w += 1;
                            slots[slot].jump = Jump::Update;
                            retry.push_back(slot);
                        } else {
                            self.stats.fp_collision_w += 1;
                            slots[slot].hash.cnt += 1;
                            master.push_back(slot);
                        }
                        break 'machine;
                    }
                    Stage::Update => {
                        if !self.cmt.is_hit(lpa) {
                            stage = Stage::Begin;
                            continue;
                        }
                        let pte = self.cmt.get_pte(lpa);
                        let grains = slots[slot].grains;
                        if !pte.ppa.is_invalid() {
                            // Overwrite: the old run dies before the new
                            // mapping is committed.
                            let len = self.oob.run_len(pte.ppa.page(), pte.ppa.offset());
                            self.mark_grain_invalid(pte.ppa, len);
                            if self.inv_log.is_some() {
                                self.record_inv_mapping(lpa, pte.ppa.page(), credits, stime);
                            }
                            self.space_used -= (len * GRAIN_SIZE) as u64;
                            debug!(lpa, old = ?pte.ppa, "overwrite invalidated previous pair");
                        }
                        self.space_used += u64::from(grains) * GRAIN_SIZE as u64;

                        let new_pte = PtEntry {
                            ppa: slots[slot].pga,
                            fp: slots[slot].hash.fp,
                        };
                        self.cmt.update(lpa, new_pte);
                        self.dedup.insert(slots[slot].pga, lpa);
                        self.max_try = self.max_try.max(slots[slot].hash.cnt);
                        self.stats
                            .record_hash_collisions(slots[slot].hash.cnt, Rw::Write);
                        self.oob.set_run(
                            slots[slot].pga.page(),
                            slots[slot].pga.offset(),
                            lpa,
                            grains as usize,
                        );
                        updated += 1;
                        break 'machine;
                    }
                }
            }
        }

        assert!(
            master.is_empty() && retry.is_empty(),
            "mapping update finished with queued entries"
        );
        ns_latest
    }

    /// Stage C: push the packed pages through the lower layer and charge
    /// the grain credits for everything this flush wrote.
    fn wb_flush_pages(
        &mut self,
        flush_list: Vec<(Ppa, Vec<u8>)>,
        credits: &mut u32,
        stime: u64,
    ) -> u64 {
        let mut ns_latest = stime;
        for (page, image) in flush_list {
            let ns = self.nand_write_page(page, &image, stime);
            self.stats.data_w += 1;
            *credits += GRAIN_PER_PAGE as u32;
            ns_latest = ns_latest.max(ns);
        }
        ns_latest
    }

    // ---- retrieve / delete ------------------------------------------------

    pub fn retrieve(&mut self, key: Key) -> Result<Reply> {
        self.read_path(key, false)
    }

    pub fn delete(&mut self, key: Key) -> Result<Reply> {
        self.read_path(key, true)
    }

    fn read_path(&mut self, key: Key, for_del: bool) -> Result<Reply> {
        let stime = self.tick();

        // 1. Write-buffer probe: the pair may not have reached flash yet.
        let mut wb_deleted = false;
        if self.wb.probe(&key).is_some() {
            self.stats.wb_hit += 1;
            if for_del {
                // Drop the buffered copy, then continue below: an older
                // flushed copy of the key must die with it.
                let _dropped = self.wb.remove(&key);
                wb_deleted = true;
            } else {
                let value = self.wb.probe(&key).unwrap().value.clone();
                let nsecs = self.pcie.advance(stime, value.len().max(GRAIN_SIZE));
                return Ok(Reply {
                    nsecs,
                    value: Some(value),
                    source: ValueSource::WriteBuffer,
                });
            }
        }

        let nr_entries = self.cfg.nr_valid_tentries();
        let mut h = HashMeta::new(&key);
        let mut credits: u32 = 0;
        let mut ns_latest = stime;

        let outcome = loop {
            if h.cnt > self.max_try {
                break Err(KvError::KeyNotExist);
            }
            let lpa = h.lpa(nr_entries);

            // 2. Cache probe; miss loads and lists up the chunk.
            if self.cmt.is_hit(lpa) {
                self.cmt.touch(lpa);
            } else {
                match self.cache_load(lpa, Waiter::Read, stime) {
                    LoadOutcome::NoTranslation => break Err(KvError::KeyNotExist),
                    LoadOutcome::Issued(ns) => ns_latest = ns_latest.max(ns),
                    LoadOutcome::Deferred => unreachable!(),
                }
                let (_, ns, freed) = self.cache_list_up(lpa, stime, &mut credits, OpCause::Read);
                debug_assert!(freed.is_empty());
                ns_latest = ns_latest.max(ns);
            }

            let pte = self.cmt.get_pte(lpa);

            // 3. Fast fingerprint reject.
            if self.cfg.store_key_fp && pte.fp != h.fp {
                h.cnt += 1;
                continue;
            }
            if pte.ppa.is_invalid() {
                if !self.cfg.store_key_fp && pte.fp != FP_MAX {
                    // A tombstone, but with no fingerprint compare there is
                    // no telling whose. Keep probing so deeper same-hash
                    // keys stay reachable; only a virgin slot ends the
                    // chain.
                    h.cnt += 1;
                    continue;
                }
                break Err(KvError::KeyNotExist);
            }

            // 4. Data read and authoritative key compare.
            let (buf, ns) = self.nand_read_page(pte.ppa.page(), stime);
            self.stats.data_r += 1;
            self.stats.d_read_on_read += 1;
            ns_latest = ns_latest.max(ns);

            let rec_bytes = &buf[pte.ppa.offset() * GRAIN_SIZE..];
            let stored = KvRecord::decode_key(rec_bytes).expect("mapped grain holds no record");
            if stored != key.as_bytes() {
                self.stats.fp_collision_r += 1;
                h.cnt += 1;
                continue;
            }

            self.stats.fp_match_r += 1;
            self.stats.record_hash_collisions(h.cnt, Rw::Read);

            if for_del {
                let page = pte.ppa.page();
                let offset = pte.ppa.offset();
                let len = self.oob.run_len(page, offset);
                self.oob.set(page, offset, OOB_TOMBSTONE);
                self.mark_grain_invalid(pte.ppa, len);
                if self.inv_log.is_some() {
                    self.record_inv_mapping(lpa, page, &mut credits, stime);
                }
                self.cmt.update(
                    lpa,
                    PtEntry {
                        ppa: GrainAddr::INVALID,
                        fp: pte.fp,
                    },
                );
                self.dedup.insert_tombstone(lpa);
                self.space_used -= (len * GRAIN_SIZE) as u64;
                debug!(lpa, len, "pair deleted");
                break Ok(Reply {
                    nsecs: ns_latest,
                    value: None,
                    source: ValueSource::Flash,
                });
            }

            let rec = KvRecord::decode(rec_bytes).expect("mapped grain holds no record");
            break Ok(Reply {
                nsecs: ns_latest,
                value: Some(rec.value.to_vec()),
                source: ValueSource::Flash,
            });
        };

        // A delete satisfied from the buffer alone still succeeds.
        let outcome = match outcome {
            Err(KvError::KeyNotExist) if wb_deleted => Ok(Reply {
                nsecs: stime,
                value: None,
                source: ValueSource::WriteBuffer,
            }),
            other => other,
        };

        if outcome.is_err() {
            warn!(?key, "read target not found");
        }
        if credits > 0 {
            self.consume_write_credit(credits);
            self.check_and_refill_write_credit(stime);
        }
        outcome
    }

    /// Wait for the device to drain; returns the idle timestamp.
    pub fn flush(&mut self) -> u64 {
        self.nand.next_idle().max(self.clock)
    }

    // ---- introspection ----------------------------------------------------

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn lines(&self) -> &LineManager {
        &self.lines
    }

    pub fn cache(&self) -> &Cmt {
        &self.cmt
    }

    pub fn config(&self) -> &FtlConfig {
        &self.cfg
    }

    pub fn write_buffer_len(&self) -> usize {
        self.wb.len()
    }

    pub fn page_state(&self, page: Ppa) -> PageState {
        self.pages[page as usize]
    }

    pub fn grain_valid(&self, grain: GrainAddr) -> bool {
        self.bitmap.is_valid(grain)
    }

    pub fn oob_word(&self, page: Ppa, offset: usize) -> u64 {
        self.oob.get(page, offset)
    }

    pub fn space_used(&self) -> u64 {
        self.space_used
    }

    pub fn max_try(&self) -> u32 {
        self.max_try
    }

    pub fn write_credits(&self) -> i64 {
        self.flow.write_credits
    }

    pub fn free_data_lines(&self) -> usize {
        self.bpm.free_count(Partition::Data)
    }

    pub fn free_map_lines(&self) -> usize {
        self.bpm.free_count(Partition::Map)
    }

    /// Erase cycles of one block, for wear inspection.
    pub fn erase_count(&self, line: u32, unit: u32) -> u32 {
        self.bpm.erase_count(line, unit)
    }

    /// Cross-checks the grain bitmap against per-line counters and the
    /// cache against its LRU bookkeeping. Panics on divergence.
    pub fn check_invariants(&self) {
        let geom = &self.cfg.geometry;
        for id in 0..geom.tt_lines() {
            let line = self.lines.line(id);
            let counted = self.bitmap.count_valid(self.lines.line_pages(id).into_iter());
            assert_eq!(
                line.vgc, counted,
                "line {id}: vgc {} != bitmap count {counted}",
                line.vgc
            );
            assert!(line.vgc + line.igc <= geom.grains_per_line());
        }
        assert!(self.cmt.nr_cached_tpages() <= self.cmt.max_cached_tpages());
    }
}
