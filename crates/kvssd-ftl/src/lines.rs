use std::collections::HashSet;

use kvssd_collections::VictimQueue;
use kvssd_types::{Geometry, Ppa, PpaParts};
use tracing::{debug, trace};

/// Allocation stream. Each stream owns one open line at a time; pages of
/// different streams never share a line between erases.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IoStream {
    User,
    Map,
    Gc,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LineState {
    Free,
    Open,
    Full,
    Victim,
}

/// One super-block: the same block id taken across every channel and LUN.
#[derive(Clone, Copy, Debug)]
pub struct Line {
    pub id: u32,
    /// Valid grain count.
    pub vgc: u32,
    /// Invalid grain count.
    pub igc: u32,
    pub state: LineState,
}

/// Position cursors of one allocation stream. Advances a page at a time,
/// striping page-in-wordline, then channel, then LUN, then the next
/// wordline, and rolls to a fresh line when the block pages run out.
#[derive(Clone, Copy, Debug)]
pub struct WritePointer {
    pub line: u32,
    pub ch: u32,
    pub lun: u32,
    pub pg: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub struct OutOfLines;

pub struct LineManager {
    geom: Geometry,
    /// Lines below this id belong to the data partition; only those are
    /// eligible for the victim queue.
    data_lines: u32,
    lines: Vec<Line>,
    victim_q: VictimQueue<u32>,
    full: HashSet<u32>,
    user_wp: WritePointer,
    map_wp: WritePointer,
    gc_wp: WritePointer,
}

impl LineManager {
    /// The initial line of each stream has already been drawn from the
    /// block manager.
    pub fn new(
        geom: Geometry,
        data_lines: u32,
        user_line: u32,
        map_line: u32,
        gc_line: u32,
    ) -> Self {
        let mut lines: Vec<Line> = (0..geom.tt_lines())
            .map(|id| Line {
                id,
                vgc: 0,
                igc: 0,
                state: LineState::Free,
            })
            .collect();
        for id in [user_line, map_line, gc_line] {
            lines[id as usize].state = LineState::Open;
        }
        LineManager {
            geom,
            data_lines,
            lines,
            victim_q: VictimQueue::new(),
            full: HashSet::new(),
            user_wp: WritePointer { line: user_line, ch: 0, lun: 0, pg: 0 },
            map_wp: WritePointer { line: map_line, ch: 0, lun: 0, pg: 0 },
            gc_wp: WritePointer { line: gc_line, ch: 0, lun: 0, pg: 0 },
        }
    }

    pub fn line(&self, id: u32) -> &Line {
        &self.lines[id as usize]
    }

    pub fn wp(&self, stream: IoStream) -> &WritePointer {
        match stream {
            IoStream::User => &self.user_wp,
            IoStream::Map => &self.map_wp,
            IoStream::Gc => &self.gc_wp,
        }
    }

    fn wp_mut(&mut self, stream: IoStream) -> &mut WritePointer {
        match stream {
            IoStream::User => &mut self.user_wp,
            IoStream::Map => &mut self.map_wp,
            IoStream::Gc => &mut self.gc_wp,
        }
    }

    pub fn victim_count(&self) -> usize {
        self.victim_q.len()
    }

    pub fn full_count(&self) -> usize {
        self.full.len()
    }

    /// Page the stream will write next.
    pub fn next_page(&self, stream: IoStream) -> Ppa {
        let wp = self.wp(stream);
        self.geom.parts_to_ppa(PpaParts {
            ch: wp.ch,
            lun: wp.lun,
            pl: 0,
            blk: wp.line,
            pg: wp.pg,
        })
    }

    /// Move the stream's cursor past the page just taken. When the line is
    /// exhausted it closes (full when untouched by invalidations, victim
    /// otherwise) and the stream continues on `next_line`, which the caller
    /// obtains from the block manager; `Err(OutOfLines)` reports that the
    /// caller must supply one first.
    pub fn advance(
        &mut self,
        stream: IoStream,
        next_line: impl FnOnce() -> Option<u32>,
    ) -> Result<(), OutOfLines> {
        let geom = self.geom;
        let wp = self.wp_mut(stream);
        debug_assert!(wp.pg < geom.pgs_per_blk);

        wp.pg += 1;
        if wp.pg % geom.pgs_per_wordline != 0 {
            return Ok(());
        }

        wp.pg -= geom.pgs_per_wordline;
        wp.ch += 1;
        if wp.ch != geom.nchs {
            return Ok(());
        }

        wp.ch = 0;
        wp.lun += 1;
        if wp.lun != geom.luns_per_ch {
            return Ok(());
        }

        wp.lun = 0;
        wp.pg += geom.pgs_per_wordline;
        if wp.pg != geom.pgs_per_blk {
            return Ok(());
        }

        // Line exhausted.
        wp.pg = 0;
        let closed = wp.line;
        let Some(fresh) = next_line() else {
            // Roll the cursor back so a retry after GC resumes here.
            let wp = self.wp_mut(stream);
            wp.pg = geom.pgs_per_blk - 1;
            wp.ch = geom.nchs - 1;
            wp.lun = geom.luns_per_ch - 1;
            return Err(OutOfLines);
        };
        self.wp_mut(stream).line = fresh;
        self.open_line(fresh);
        self.close_line(closed);
        trace!(stream = ?stream, closed, fresh, "write pointer rolled to a new line");
        Ok(())
    }

    fn open_line(&mut self, id: u32) {
        let line = &mut self.lines[id as usize];
        assert_eq!(line.state, LineState::Free, "line {id} not free");
        line.state = LineState::Open;
    }

    fn close_line(&mut self, id: u32) {
        let data = id < self.data_lines;
        let line = &mut self.lines[id as usize];
        assert_eq!(line.state, LineState::Open);
        if line.igc == 0 {
            line.state = LineState::Full;
            if data {
                self.full.insert(id);
            }
            debug!(line = id, vgc = line.vgc, "line closed full");
        } else {
            assert!(line.vgc < self.geom.grains_per_line());
            line.state = LineState::Victim;
            let vgc = line.vgc;
            if data {
                self.victim_q.push(id, vgc);
            }
            debug!(line = id, vgc, igc = line.igc, "line closed into victim queue");
        }
    }

    /// Account `len` newly-valid grains on the line owning `page`.
    pub fn add_valid(&mut self, page: Ppa, len: u32) {
        let id = self.geom.line_of(page);
        let cap = self.geom.grains_per_line();
        let line = &mut self.lines[id as usize];
        assert!(line.vgc + len <= cap, "line {id} over-filled");
        line.vgc += len;
    }

    /// Account `len` invalidated grains on the line owning `page`, keeping
    /// the victim queue ordered and firing the full-to-victim transition
    /// exactly once.
    pub fn add_invalid(&mut self, page: Ppa, len: u32) {
        let id = self.geom.line_of(page);
        let cap = self.geom.grains_per_line();
        let line = &mut self.lines[id as usize];

        assert!(line.igc + len <= cap, "line {id} igc overflow");
        assert!(line.vgc >= len, "line {id} vgc underflow");
        let was_full = line.state == LineState::Full && line.igc == 0;
        line.igc += len;
        line.vgc -= len;
        let vgc = line.vgc;

        if self.victim_q.contains(id) {
            self.victim_q.change_priority(id, vgc);
        }

        if was_full {
            self.full.remove(&id);
            self.lines[id as usize].state = LineState::Victim;
            if id < self.data_lines {
                self.victim_q.push(id, vgc);
            }
            debug!(line = id, vgc, "full line became a victim");
        }
    }

    /// Pop the least-valid victim line. Without `force`, a victim still
    /// holding more than 1/8 of its grains valid is left queued.
    pub fn select_victim(&mut self, force: bool) -> Option<u32> {
        let (id, vgc) = self.victim_q.peek()?;
        if !force && vgc > self.geom.grains_per_line() / 8 {
            return None;
        }
        self.victim_q.pop();
        debug!(line = id, vgc, "selected victim line");
        Some(id)
    }

    /// Reset a cleaned line to the free state.
    pub fn mark_line_free(&mut self, id: u32) {
        let line = &mut self.lines[id as usize];
        assert_eq!(line.vgc, 0, "freeing line {id} with valid grains");
        line.igc = 0;
        line.state = LineState::Free;
        debug!(line = id, "line freed");
    }

    /// Close the stream's current line and continue it on another, already
    /// partially-written line (map GC hands the reserve line's cursor over
    /// to the map stream).
    pub(crate) fn swap_open_line(&mut self, stream: IoStream, wp: WritePointer) {
        let old = self.wp(stream).line;
        assert_ne!(old, wp.line);
        self.close_line(old);
        self.open_line(wp.line);
        *self.wp_mut(stream) = wp;
    }

    /// Pages of one line in cleaning order: wordline-major, then channel,
    /// then LUN.
    pub fn line_pages(&self, id: u32) -> Vec<Ppa> {
        let g = &self.geom;
        let mut pages = Vec::with_capacity(g.pgs_per_line() as usize);
        let wordlines = g.pgs_per_blk / g.pgs_per_wordline;
        for wl in 0..wordlines {
            for ch in 0..g.nchs {
                for lun in 0..g.luns_per_ch {
                    for sub in 0..g.pgs_per_wordline {
                        pages.push(g.parts_to_ppa(PpaParts {
                            ch,
                            lun,
                            pl: 0,
                            blk: id,
                            pg: wl * g.pgs_per_wordline + sub,
                        }));
                    }
                }
            }
        }
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> Geometry {
        Geometry::new(2, 2, 8, 8, 4).unwrap()
    }

    fn mgr() -> LineManager {
        LineManager::new(geom(), 6, 0, 6, 5)
    }

    #[test]
    fn advance_stripes_wordline_then_channel_then_lun() {
        let g = geom();
        let mut lm = mgr();
        let mut seen = Vec::new();
        // One full line: pgs_per_line pages, no rollover needed.
        for _ in 0..g.pgs_per_line() - 1 {
            seen.push(lm.next_page(IoStream::User));
            lm.advance(IoStream::User, || panic!("should not roll over"))
                .unwrap();
        }
        seen.push(lm.next_page(IoStream::User));

        // All pages distinct and all within line 0.
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), g.pgs_per_line() as usize);
        assert!(seen.iter().all(|&p| g.line_of(p) == 0));

        // First four allocations fill wordline 0 of (ch0, lun0), then move
        // to ch1 before touching lun1.
        let parts = g.ppa_parts(seen[4]);
        assert_eq!((parts.ch, parts.lun, parts.pg), (1, 0, 0));
    }

    #[test]
    fn exhausted_line_closes_full_and_rolls() {
        let g = geom();
        let mut lm = mgr();
        for _ in 0..g.pgs_per_line() - 1 {
            lm.advance(IoStream::User, || unreachable!()).unwrap();
        }
        lm.advance(IoStream::User, || Some(1)).unwrap();
        assert_eq!(lm.line(0).state, LineState::Full);
        assert_eq!(lm.line(1).state, LineState::Open);
        assert_eq!(lm.wp(IoStream::User).line, 1);
        assert_eq!(lm.full_count(), 1);
    }

    #[test]
    fn rollover_without_lines_is_retryable() {
        let g = geom();
        let mut lm = mgr();
        for _ in 0..g.pgs_per_line() - 1 {
            lm.advance(IoStream::User, || unreachable!()).unwrap();
        }
        assert_eq!(lm.advance(IoStream::User, || None), Err(OutOfLines));
        // A retry with a line available must succeed and close exactly once.
        lm.advance(IoStream::User, || Some(2)).unwrap();
        assert_eq!(lm.line(0).state, LineState::Full);
        assert_eq!(lm.wp(IoStream::User).line, 2);
    }

    #[test]
    fn full_line_becomes_victim_on_first_invalidation() {
        let g = geom();
        let mut lm = mgr();
        let cap = g.grains_per_line();
        let first_page = lm.next_page(IoStream::User);
        lm.add_valid(first_page, cap);
        for _ in 0..g.pgs_per_line() - 1 {
            lm.advance(IoStream::User, || unreachable!()).unwrap();
        }
        lm.advance(IoStream::User, || Some(3)).unwrap();
        assert_eq!(lm.line(0).state, LineState::Full);

        lm.add_invalid(first_page, 2);
        assert_eq!(lm.line(0).state, LineState::Victim);
        assert_eq!(lm.victim_count(), 1);
        assert_eq!(lm.full_count(), 0);

        // Further invalidations re-key the queued entry.
        lm.add_invalid(first_page, 1);
        assert_eq!(lm.line(0).vgc, cap - 3);
        assert_eq!(lm.select_victim(true), Some(0));
    }

    #[test]
    fn victim_threshold_respected_unless_forced() {
        let g = geom();
        let mut lm = mgr();
        let cap = g.grains_per_line();
        let page = lm.next_page(IoStream::User);
        lm.add_valid(page, cap);
        for _ in 0..g.pgs_per_line() - 1 {
            lm.advance(IoStream::User, || unreachable!()).unwrap();
        }
        lm.advance(IoStream::User, || Some(4)).unwrap();
        // Invalidate only a sliver: far above the 1/8-valid threshold.
        lm.add_invalid(page, 1);
        assert_eq!(lm.select_victim(false), None);
        assert_eq!(lm.select_victim(true), Some(0));
    }
}
