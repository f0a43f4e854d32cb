use std::collections::HashMap;

use kvssd_types::{Lpa, Ppa, PAGE_SIZE};

/// One buffered `(lpa, ppa)` invalidation record.
const INV_REC_LEN: usize = 8;

/// Per-line buffers of invalidated mappings, flushed to tagged map-stream
/// pages when full (non-standard GC mode). The index remembers which flash
/// pages hold flushed records for each line so the log survives relocation
/// and can be dropped wholesale when the line itself is collected.
pub struct InvMappingLog {
    bufs: Vec<Vec<u8>>,
    /// Flushed log page -> data line it describes.
    index: HashMap<Ppa, u32>,
}

impl InvMappingLog {
    pub fn new(data_lines: u32) -> Self {
        InvMappingLog {
            bufs: (0..data_lines).map(|_| Vec::with_capacity(PAGE_SIZE)).collect(),
            index: HashMap::new(),
        }
    }

    /// True when appending one more record would overflow the page-sized
    /// buffer; the caller must flush first.
    pub fn would_overflow(&self, line: u32) -> bool {
        self.bufs[line as usize].len() + INV_REC_LEN > PAGE_SIZE
    }

    pub fn append(&mut self, line: u32, lpa: Lpa, ppa: Ppa) {
        let buf = &mut self.bufs[line as usize];
        debug_assert!(buf.len() + INV_REC_LEN <= PAGE_SIZE);
        buf.extend_from_slice(&lpa.to_le_bytes());
        buf.extend_from_slice(&ppa.to_le_bytes());
    }

    /// Take the line's buffered records padded to a full page image.
    pub fn take_page(&mut self, line: u32) -> Vec<u8> {
        let buf = &mut self.bufs[line as usize];
        let mut page = std::mem::take(buf);
        page.resize(PAGE_SIZE, 0);
        page
    }

    pub fn note_flushed(&mut self, page: Ppa, line: u32) {
        self.index.insert(page, line);
    }

    pub fn is_log_page(&self, page: Ppa) -> bool {
        self.index.contains_key(&page)
    }

    /// Map GC moved a log page; returns the data line the log describes.
    pub fn relocate(&mut self, old: Ppa, new: Ppa) -> u32 {
        let line = self.index.remove(&old).expect("relocating unknown log page");
        self.index.insert(new, line);
        line
    }

    /// Drop everything recorded about `line`: its buffered records and the
    /// flash pages holding flushed ones. Returns the dropped pages so the
    /// caller can invalidate their grains.
    pub fn purge_line(&mut self, line: u32) -> Vec<Ppa> {
        self.bufs[line as usize].clear();
        let dead: Vec<Ppa> = self
            .index
            .iter()
            .filter(|(_, &l)| l == line)
            .map(|(&p, _)| p)
            .collect();
        for p in &dead {
            self.index.remove(p);
        }
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_fills_to_one_page() {
        let mut log = InvMappingLog::new(2);
        let per_page = PAGE_SIZE / INV_REC_LEN;
        for i in 0..per_page {
            assert!(!log.would_overflow(0), "overflowed early at {i}");
            log.append(0, i as u32, 1000 + i as u32);
        }
        assert!(log.would_overflow(0));
        let page = log.take_page(0);
        assert_eq!(page.len(), PAGE_SIZE);
        assert_eq!(&page[0..4], &0u32.to_le_bytes());
        assert!(!log.would_overflow(0));
    }

    #[test]
    fn purge_forgets_flushed_pages() {
        let mut log = InvMappingLog::new(2);
        log.note_flushed(17, 0);
        log.note_flushed(18, 1);
        assert!(log.is_log_page(17));
        log.relocate(17, 30);
        assert!(log.is_log_page(30));
        assert!(!log.is_log_page(17));

        let dropped = log.purge_line(0);
        assert_eq!(dropped, vec![30]);
        assert!(log.is_log_page(18));
    }
}
