use kvssd_types::{GrainAddr, Lpa, OobWord, Ppa, GRAIN_PER_PAGE, OOB_CONTINUATION};

/// Per-page out-of-band area: one word per grain. The first grain of a pair
/// holds its LPA; the following grains of the same pair hold
/// [`OOB_CONTINUATION`], which is how run lengths are recovered without any
/// in-record length walk.
pub struct OobTable {
    words: Vec<OobWord>,
}

impl OobTable {
    pub fn new(tt_pgs: u32) -> Self {
        OobTable {
            words: vec![0; tt_pgs as usize * GRAIN_PER_PAGE],
        }
    }

    #[inline]
    fn slot(&self, page: Ppa, offset: usize) -> usize {
        debug_assert!(offset < GRAIN_PER_PAGE);
        page as usize * GRAIN_PER_PAGE + offset
    }

    #[inline]
    pub fn get(&self, page: Ppa, offset: usize) -> OobWord {
        self.words[self.slot(page, offset)]
    }

    #[inline]
    pub fn set(&mut self, page: Ppa, offset: usize, word: OobWord) {
        let slot = self.slot(page, offset);
        self.words[slot] = word;
    }

    /// Tag a pair of `len` grains starting at `(page, offset)` with `lpa`,
    /// marking the rest of the run as continuations.
    pub fn set_run(&mut self, page: Ppa, offset: usize, lpa: Lpa, len: usize) {
        debug_assert!(offset + len <= GRAIN_PER_PAGE);
        self.set(page, offset, OobWord::from(lpa));
        for i in 1..len {
            self.set(page, offset + i, OOB_CONTINUATION);
        }
    }

    /// Length in grains of the run starting at `offset`, found by walking
    /// continuation markers. Runs never cross a page boundary.
    pub fn run_len(&self, page: Ppa, offset: usize) -> usize {
        let mut len = 1;
        while offset + len < GRAIN_PER_PAGE
            && self.get(page, offset + len) == OOB_CONTINUATION
        {
            len += 1;
        }
        len
    }

    pub fn reset_page(&mut self, page: Ppa) {
        let base = page as usize * GRAIN_PER_PAGE;
        self.words[base..base + GRAIN_PER_PAGE].fill(0);
    }
}

/// One validity bit per grain: set while the grain is referenced by a live
/// translation entry or a live mapping page.
pub struct GrainBitmap {
    bits: Vec<bool>,
}

impl GrainBitmap {
    pub fn new(tt_grains: u64) -> Self {
        GrainBitmap {
            bits: vec![false; tt_grains as usize],
        }
    }

    #[inline]
    pub fn is_valid(&self, grain: GrainAddr) -> bool {
        self.bits[grain.raw() as usize]
    }

    /// Marks `len` grains valid. Double-marking is a bookkeeping corruption
    /// and aborts.
    pub fn set_valid(&mut self, grain: GrainAddr, len: usize) {
        for i in 0..len {
            let idx = grain.raw() as usize + i;
            assert!(!self.bits[idx], "grain {idx} already valid");
            self.bits[idx] = true;
        }
    }

    /// Marks `len` grains invalid; they must currently be valid.
    pub fn clear_valid(&mut self, grain: GrainAddr, len: usize) {
        for i in 0..len {
            let idx = grain.raw() as usize + i;
            assert!(self.bits[idx], "grain {idx} double-freed");
            self.bits[idx] = false;
        }
    }

    /// True when no grain of `page` is valid.
    pub fn page_all_invalid(&self, page: Ppa) -> bool {
        let base = page as usize * GRAIN_PER_PAGE;
        self.bits[base..base + GRAIN_PER_PAGE].iter().all(|&b| !b)
    }

    /// Valid grains within the given line's page range, for invariant
    /// checks.
    pub fn count_valid(&self, pages: impl Iterator<Item = Ppa>) -> u32 {
        let mut n = 0;
        for page in pages {
            let base = page as usize * GRAIN_PER_PAGE;
            n += self.bits[base..base + GRAIN_PER_PAGE]
                .iter()
                .filter(|&&b| b)
                .count() as u32;
        }
        n
    }
}
