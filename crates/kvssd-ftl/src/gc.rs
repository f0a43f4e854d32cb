//! Garbage collection: data-line cleaning with mapping patch-up, and map
//! partition compaction through the reserve segment.

use kvssd_media::{NandOp, NandOpKind};
use kvssd_types::{
    GrainAddr, Lpa, Ppa, PpaParts, EPP, GRAIN_PER_PAGE, GRAIN_SIZE, OOB_INV_MAPPING,
    OOB_TOMBSTONE, PAGE_SIZE,
};
use tracing::{debug, warn};

use crate::cache::{Cmt, NO_TPAGE};
use crate::lines::{IoStream, WritePointer};
use crate::partition::Partition;
use crate::shard::{DemandShard, MapPageOwner, OpCause, PageState};

struct Rewrite {
    lpa: Lpa,
    len: u32,
    old: GrainAddr,
    new: GrainAddr,
}

impl DemandShard {
    /// One data-GC cycle: pick the least-valid victim line, rewrite its
    /// live grains through the GC stream, patch the mapping, erase, refill
    /// credits with the victim's dead-grain count.
    pub(crate) fn do_gc(&mut self, force: bool, stime: u64) -> bool {
        let Some(victim) = self.lines.select_victim(force) else {
            warn!("gc requested but no victim line available");
            return false;
        };
        self.stats.gc_cycles += 1;
        let refill = self.lines.line(victim).igc;
        self.set_refill(refill);
        debug!(victim, refill, "collecting data line");

        let mut gc_credits: u32 = 0;
        let pages = self.lines.line_pages(victim);
        let wordline = self.cfg.geometry.pgs_per_wordline as usize;
        for group in pages.chunks(wordline) {
            self.clean_one_flashpg(group, &mut gc_credits, stime);
        }

        self.erase_line_blocks(victim, stime);
        self.lines.mark_line_free(victim);
        self.bpm.trim_segment(Partition::Data, victim);
        if self.inv_log.is_some() {
            self.purge_inv_log(victim);
        }
        if gc_credits > 0 {
            self.consume_write_credit(gc_credits);
        }
        true
    }

    /// Collect one flash-page group of the victim: gather live grain runs
    /// from the OOB, invalidate them, repack longest-first into GC-stream
    /// pages, and patch the mapping.
    fn clean_one_flashpg(&mut self, group: &[Ppa], gc_credits: &mut u32, stime: u64) {
        let mut list: Vec<Rewrite> = Vec::new();
        let mut valid_pages = 0u32;

        for &page in group {
            assert_ne!(
                self.page_state(page),
                PageState::Free,
                "free page inside a victim line"
            );
            if self.page_state(page) == PageState::Valid {
                valid_pages += 1;
            }
            let mut offset = 0;
            while offset < GRAIN_PER_PAGE {
                let grain = GrainAddr::new(page, offset);
                if !self.grain_valid(grain) {
                    offset += 1;
                    continue;
                }
                let word = self.oob.get(page, offset);
                debug_assert!(
                    word != 0 && word != OOB_TOMBSTONE && word != OOB_INV_MAPPING,
                    "valid grain with a non-LPA OOB word"
                );
                let len = self.oob.run_len(page, offset);
                list.push(Rewrite {
                    lpa: word as Lpa,
                    len: len as u32,
                    old: grain,
                    new: GrainAddr::INVALID,
                });
                self.mark_grain_invalid(grain, len);
                offset += len;
            }
        }

        if list.is_empty() {
            return;
        }

        // Longest runs first so page packing stays tight.
        list.sort_by(|a, b| b.len.cmp(&a.len));

        // One batched read covers the group's live pages.
        self.nand.advance(&NandOp {
            kind: NandOpKind::Read,
            target: self.cfg.geometry.ppa_parts(group[0]),
            xfer_bytes: valid_pages as usize * PAGE_SIZE,
            stime,
        });
        self.stats.data_r_dgc += 1;

        let mut i = 0;
        while i < list.len() {
            let dst = self.new_gc_page();
            let mut offset = 0usize;

            while offset < GRAIN_PER_PAGE {
                let remain = GRAIN_PER_PAGE - offset;
                let Some(j) = (i..list.len()).find(|&j| list[j].len as usize <= remain) else {
                    break;
                };
                list.swap(i, j);

                let (lpa, len, old) = (list[i].lpa, list[i].len as usize, list[i].old);
                let new = GrainAddr::new(dst, offset);
                list[i].new = new;

                let mut bytes = vec![0u8; len * GRAIN_SIZE];
                self.media
                    .read_at(old.byte_offset(), &mut bytes)
                    .expect("gc source read out of range");
                self.media
                    .write_at(new.byte_offset(), &bytes)
                    .expect("gc destination write out of range");

                self.oob.set_run(dst, offset, lpa, len);
                self.mark_grain_valid(new, len);
                debug!(lpa, ?old, ?new, len, "live grains rewritten");

                offset += len;
                i += 1;
            }

            if offset < GRAIN_PER_PAGE {
                let pad = GRAIN_PER_PAGE - offset;
                let pga = GrainAddr::new(dst, offset);
                self.mark_grain_valid(pga, pad);
                self.mark_grain_invalid(pga, pad);
                self.oob.set(dst, offset, OOB_TOMBSTONE);
            }

            self.nand.advance(&NandOp {
                kind: NandOpKind::Write,
                target: self.cfg.geometry.ppa_parts(dst),
                xfer_bytes: PAGE_SIZE,
                stime,
            });
            self.stats.data_w_dgc += 1;
        }

        self.bulk_mapping_update(&list, gc_credits, stime);
    }

    /// Point every rewritten LPA at its new grains, faulting translation
    /// pages in (and possibly evicting) as needed.
    fn bulk_mapping_update(&mut self, list: &[Rewrite], gc_credits: &mut u32, stime: u64) {
        for r in list {
            if self.cmt.is_hit(r.lpa) {
                self.cmt.touch(r.lpa);
            } else {
                self.gc_ensure_cached(r.lpa, gc_credits, stime);
            }
            debug_assert_eq!(self.cmt.get_pte(r.lpa).ppa, r.old, "mapping drifted during gc");
            self.cmt.update_ppa(r.lpa, r.new);
        }
    }

    /// Synchronous translation-page fault for GC: no request to defer, so
    /// the load and list-up collapse into one step.
    fn gc_ensure_cached(&mut self, lpa: Lpa, gc_credits: &mut u32, stime: u64) {
        let idx = Cmt::idx_of(lpa);
        assert!(
            !self.cmt.entry(idx).is_flying,
            "mapping read in flight during gc"
        );
        let t_ppa = self.cmt.entry(idx).t_ppa;
        assert_ne!(t_ppa, NO_TPAGE, "live grain without an on-flash mapping");

        let (buf, _ns) = self.nand_read_page(t_ppa, stime);
        self.stats.trans_r += 1;
        self.stats.trans_r_dgc += 1;

        let entry = self.cmt.entry_mut(idx);
        entry.flying_buf = Some(buf);
        entry.is_flying = true;
        let (_, _, freed) = self.cache_list_up(lpa, stime, gc_credits, OpCause::Gc);
        debug_assert!(freed.is_empty());
    }

    /// Map-partition GC, entered when the map stream's line rollover finds
    /// no free segment. Compacts live translation (and invalid-mapping log)
    /// pages from the most-invalidated map line onto the reserve segment,
    /// then hands the reserve over to the map stream. The exhausted open
    /// line is itself a candidate: it is usually where the superseded
    /// pages sit.
    pub(crate) fn do_map_gc(&mut self, stime: u64) {
        assert!(
            self.bpm.is_gc_needed(Partition::Map),
            "map GC entered with free segments in the pool"
        );
        self.stats.map_gc_cycles += 1;
        let reserve = self.map_reserve;
        let target = self
            .bpm
            .get_gc_target(Partition::Map, None)
            .expect("map partition exhausted with nothing to collect");
        let victim = target.blocks[0];
        // The reserve is clean, so the most-invalid scan can never pick it.
        assert_ne!(victim, reserve);
        debug!(victim, reserve, "collecting map line");

        let dst_pages = self.lines.line_pages(reserve);
        let mut used = 0usize;

        for page in self.lines.line_pages(victim) {
            if self.page_state(page) != PageState::Valid {
                continue;
            }
            let word = self.oob.get(page, 0);
            let (buf, _ns) = self.nand_read_page(page, stime);
            self.stats.trans_r += 1;
            self.stats.trans_r_tgc += 1;

            let dst = dst_pages[used];
            used += 1;
            self.mark_page_valid(dst);
            self.mark_grain_valid(GrainAddr::new(dst, 0), GRAIN_PER_PAGE);
            self.nand_write_page(dst, &buf, stime);
            self.stats.trans_w += 1;
            self.stats.trans_w_tgc += 1;
            self.oob.set(dst, 0, word);

            if word == OOB_INV_MAPPING {
                let line = self
                    .inv_log
                    .as_mut()
                    .expect("log page without the log enabled")
                    .relocate(page, dst);
                self.oob.set(dst, 1, (u64::from(line) << 32) | u64::from(dst));
            } else {
                let idx = (word / EPP as u64) as u32;
                debug_assert_eq!(word % EPP as u64, 0);
                debug_assert_eq!(
                    self.cmt.entry(idx).t_ppa,
                    page,
                    "stale translation page still marked valid"
                );
                self.cmt.entry_mut(idx).t_ppa = dst;
            }

            self.mark_grain_invalid(GrainAddr::new(page, 0), GRAIN_PER_PAGE);
        }
        assert!(used < dst_pages.len(), "map victim had no dead pages");

        // Move the stream onto the partially-written reserve before the
        // victim (possibly the exhausted open line itself) is erased.
        let wp = self.wp_at(reserve, used);
        self.lines.swap_open_line(IoStream::Map, wp);

        self.erase_line_blocks(victim, stime);
        self.lines.mark_line_free(victim);
        self.bpm.trim_segment(Partition::Map, victim);

        // A fresh reserve comes from the pool the victim just replenished.
        self.map_reserve = self
            .bpm
            .change_reserve(Partition::Map, reserve)
            .expect("no free map segment for a fresh reserve");
        debug!(
            open = reserve,
            reserve = self.map_reserve,
            relocated = used,
            "map stream continues on the old reserve"
        );
    }

    /// Cursor position after `used` sequential page writes on `line`.
    fn wp_at(&self, line: u32, used: usize) -> WritePointer {
        let g = &self.cfg.geometry;
        let w = g.pgs_per_wordline as usize;
        let per_wordline_group = (g.nchs * g.luns_per_ch) as usize * w;
        let wl = used / per_wordline_group;
        let rem = used % per_wordline_group;
        let ch = rem / (g.luns_per_ch as usize * w);
        let rem2 = rem % (g.luns_per_ch as usize * w);
        WritePointer {
            line,
            ch: ch as u32,
            lun: (rem2 / w) as u32,
            pg: (wl * w + rem2 % w) as u32,
        }
    }

    /// Erase every block of a line: trim the medium, reset page and OOB
    /// state, bump erase counters.
    pub(crate) fn erase_line_blocks(&mut self, line: u32, stime: u64) {
        let g = self.cfg.geometry;
        for ch in 0..g.nchs {
            for lun in 0..g.luns_per_ch {
                let parts = PpaParts { ch, lun, pl: 0, blk: line, pg: 0 };
                let first = g.parts_to_ppa(parts);
                self.media
                    .erase(
                        u64::from(first) * PAGE_SIZE as u64,
                        g.pgs_per_blk as usize * PAGE_SIZE,
                    )
                    .expect("block erase out of range");
                self.nand.advance(&NandOp {
                    kind: NandOpKind::Erase,
                    target: parts,
                    xfer_bytes: 0,
                    stime,
                });
                self.bpm.note_erase(line, ch * g.luns_per_ch + lun);
                for pg in 0..g.pgs_per_blk {
                    let page = first + pg;
                    assert_ne!(
                        self.page_state(page),
                        PageState::Valid,
                        "erasing a block with live pages"
                    );
                    self.reset_page(page);
                }
            }
        }
    }

    /// Record an invalidated `(lpa, ppa)` pair for the non-standard GC
    /// mode, flushing the line's buffer to a tagged map page when full.
    pub(crate) fn record_inv_mapping(
        &mut self,
        lpa: Lpa,
        page: Ppa,
        credits: &mut u32,
        stime: u64,
    ) {
        let line = self.cfg.geometry.line_of(page);
        if self.inv_log.as_ref().unwrap().would_overflow(line) {
            self.flush_inv_log(line, credits, stime);
        }
        self.inv_log.as_mut().unwrap().append(line, lpa, page);
    }

    fn flush_inv_log(&mut self, line: u32, credits: &mut u32, stime: u64) {
        let image = self.inv_log.as_mut().unwrap().take_page(line);
        let (page, _ns) = self.write_map_page(&image, MapPageOwner::InvLog(line), stime);
        self.stats.inv_mapping_w += 1;
        *credits += GRAIN_PER_PAGE as u32;
        debug!(line, page, "invalid-mapping page flushed");
    }

    fn purge_inv_log(&mut self, line: u32) {
        let dead = self.inv_log.as_mut().unwrap().purge_line(line);
        for page in dead {
            self.mark_grain_invalid(GrainAddr::new(page, 0), GRAIN_PER_PAGE);
            debug!(line, page, "obsolete invalid-mapping page dropped");
        }
    }
}
