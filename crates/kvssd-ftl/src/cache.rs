use std::collections::VecDeque;

use kvssd_types::{Fingerprint, GrainAddr, Lpa, Ppa, EPP, FP_MAX, MAP_ENTRY_SIZE, PAGE_SIZE};
use lru::LruCache;
use tracing::trace;

/// `t_ppa` sentinel: the translation page has never been written to flash.
pub const NO_TPAGE: Ppa = Ppa::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CmtState {
    Clean,
    Dirty,
}

/// One translation entry: packed grain address of the pair plus its key
/// fingerprint. The fingerprint only accelerates inequality; key compare
/// stays authoritative.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PtEntry {
    pub ppa: GrainAddr,
    pub fp: Fingerprint,
}

impl PtEntry {
    pub const EMPTY: PtEntry = PtEntry {
        ppa: GrainAddr::INVALID,
        fp: FP_MAX,
    };
}

/// Cache slot for one translation page (one chunk of `EPP` LPAs).
pub struct CmtEntry {
    pub idx: u32,
    /// Where the page lives on flash, or [`NO_TPAGE`].
    pub t_ppa: Ppa,
    /// Resident entries; `None` while evicted or in flight.
    pub pt: Option<Box<[PtEntry]>>,
    pub state: CmtState,
    /// A mapping read for this chunk has been issued and not yet listed up.
    pub is_flying: bool,
    /// Bytes delivered by the in-flight mapping read, consumed at list-up.
    pub flying_buf: Option<Vec<u8>>,
    /// Write-buffer slots deferred on the in-flight load.
    pub retry_q: VecDeque<usize>,
}

/// Cached mapping table: page-granular, LRU-evicted, write-back.
pub struct Cmt {
    entries: Vec<CmtEntry>,
    lru: LruCache<u32, ()>,
    max_cached: usize,
    nr_cached: usize,
}

impl Cmt {
    pub fn new(nr_tpages: u32, max_cached: usize) -> Self {
        let entries = (0..nr_tpages)
            .map(|idx| CmtEntry {
                idx,
                t_ppa: NO_TPAGE,
                pt: None,
                state: CmtState::Clean,
                is_flying: false,
                flying_buf: None,
                retry_q: VecDeque::new(),
            })
            .collect();
        Cmt {
            entries,
            lru: LruCache::unbounded(),
            max_cached,
            nr_cached: 0,
        }
    }

    #[inline]
    pub fn idx_of(lpa: Lpa) -> u32 {
        lpa / EPP as u32
    }

    #[inline]
    pub fn offset_of(lpa: Lpa) -> usize {
        (lpa % EPP as u32) as usize
    }

    pub fn entry(&self, idx: u32) -> &CmtEntry {
        &self.entries[idx as usize]
    }

    pub fn entry_mut(&mut self, idx: u32) -> &mut CmtEntry {
        &mut self.entries[idx as usize]
    }

    pub fn nr_cached_tpages(&self) -> usize {
        self.nr_cached
    }

    pub fn max_cached_tpages(&self) -> usize {
        self.max_cached
    }

    /// True iff the translation page holding `lpa` is resident.
    pub fn is_hit(&self, lpa: Lpa) -> bool {
        self.entries[Self::idx_of(lpa) as usize].pt.is_some()
    }

    pub fn is_full(&self) -> bool {
        self.nr_cached >= self.max_cached
    }

    /// Bump the chunk to most-recently-used.
    pub fn touch(&mut self, lpa: Lpa) {
        self.lru.get(&Self::idx_of(lpa));
    }

    /// Entry for `lpa`; the chunk must be resident.
    pub fn get_pte(&self, lpa: Lpa) -> PtEntry {
        let entry = &self.entries[Self::idx_of(lpa) as usize];
        let pt = entry.pt.as_ref().expect("get_pte on a non-resident chunk");
        pt[Self::offset_of(lpa)]
    }

    /// Install `pte` and mark the chunk dirty.
    pub fn update(&mut self, lpa: Lpa, pte: PtEntry) {
        let idx = Self::idx_of(lpa);
        let entry = &mut self.entries[idx as usize];
        let pt = entry.pt.as_mut().expect("update on a non-resident chunk");
        pt[Self::offset_of(lpa)] = pte;
        entry.state = CmtState::Dirty;
        self.lru.get(&idx);
        trace!(lpa, ppa = ?pte.ppa, "translation entry updated");
    }

    /// Redirect only the grain address, preserving the stored fingerprint.
    /// This is the GC patch-up path.
    pub fn update_ppa(&mut self, lpa: Lpa, ppa: GrainAddr) {
        let idx = Self::idx_of(lpa);
        let entry = &mut self.entries[idx as usize];
        let pt = entry.pt.as_mut().expect("update_ppa on a non-resident chunk");
        pt[Self::offset_of(lpa)].ppa = ppa;
        entry.state = CmtState::Dirty;
    }

    /// Register a freshly materialized chunk with the LRU. The caller has
    /// already filled `pt`.
    pub fn install(&mut self, idx: u32) {
        debug_assert!(self.entries[idx as usize].pt.is_some());
        self.lru.put(idx, ());
        self.nr_cached += 1;
    }

    /// Detach the LRU tail for eviction. The caller writes back / drops the
    /// page table and must then call [`Cmt::drop_resident`].
    pub fn pop_lru_victim(&mut self) -> u32 {
        let (idx, ()) = self.lru.pop_lru().expect("evicting from an empty cache");
        idx
    }

    /// Finish an eviction: the entry loses its resident table and its LRU
    /// slot in the same step, keeping the cached-page count exact.
    pub fn drop_resident(&mut self, idx: u32) {
        let entry = &mut self.entries[idx as usize];
        entry.pt = None;
        self.nr_cached -= 1;
    }

    /// Zero-initialized page table: every entry unmapped.
    pub fn fresh_pt() -> Box<[PtEntry]> {
        vec![PtEntry::EMPTY; EPP].into_boxed_slice()
    }

    /// Decode a translation page image into resident entries.
    pub fn page_to_pt(bytes: &[u8]) -> Box<[PtEntry]> {
        debug_assert_eq!(bytes.len(), PAGE_SIZE);
        let mut pt = Vec::with_capacity(EPP);
        for i in 0..EPP {
            let base = i * MAP_ENTRY_SIZE;
            let ppa = u32::from_le_bytes(bytes[base..base + 4].try_into().unwrap());
            let fp = u32::from_le_bytes(bytes[base + 4..base + 8].try_into().unwrap());
            pt.push(PtEntry {
                ppa: GrainAddr::from_raw(ppa),
                fp,
            });
        }
        pt.into_boxed_slice()
    }

    /// Serialize resident entries into a translation page image.
    pub fn pt_to_page(pt: &[PtEntry]) -> Vec<u8> {
        debug_assert_eq!(pt.len(), EPP);
        let mut bytes = vec![0u8; PAGE_SIZE];
        for (i, entry) in pt.iter().enumerate() {
            let base = i * MAP_ENTRY_SIZE;
            bytes[base..base + 4].copy_from_slice(&entry.ppa.raw().to_le_bytes());
            bytes[base + 4..base + 8].copy_from_slice(&entry.fp.to_le_bytes());
        }
        bytes
    }
}
