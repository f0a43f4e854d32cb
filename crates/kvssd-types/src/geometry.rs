use crate::{Ppa, GRAIN_PER_PAGE, PAGE_SIZE};

/// Structured physical page address: channel, LUN, plane, block, page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PpaParts {
    pub ch: u32,
    pub lun: u32,
    pub pl: u32,
    pub blk: u32,
    pub pg: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum GeometryError {
    /// A dimension was zero.
    ZeroDimension,
    /// `pgs_per_blk` is not a multiple of the wordline size.
    WordlineMisaligned,
}

impl core::fmt::Display for GeometryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            GeometryError::ZeroDimension => write!(f, "geometry dimension is zero"),
            GeometryError::WordlineMisaligned => {
                write!(f, "pgs_per_blk is not a multiple of pgs_per_wordline")
            }
        }
    }
}

impl std::error::Error for GeometryError {}

/// NAND geometry. One plane per LUN; a "line" is block `b` taken across
/// every channel and LUN.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub nchs: u32,
    pub luns_per_ch: u32,
    pub blks_per_pl: u32,
    pub pgs_per_blk: u32,
    /// Pages programmed as one wordline (oneshot page).
    pub pgs_per_wordline: u32,
}

impl Geometry {
    pub fn new(
        nchs: u32,
        luns_per_ch: u32,
        blks_per_pl: u32,
        pgs_per_blk: u32,
        pgs_per_wordline: u32,
    ) -> Result<Self, GeometryError> {
        if nchs == 0 || luns_per_ch == 0 || blks_per_pl == 0 || pgs_per_blk == 0
            || pgs_per_wordline == 0
        {
            return Err(GeometryError::ZeroDimension);
        }
        if pgs_per_blk % pgs_per_wordline != 0 {
            return Err(GeometryError::WordlineMisaligned);
        }
        Ok(Geometry {
            nchs,
            luns_per_ch,
            blks_per_pl,
            pgs_per_blk,
            pgs_per_wordline,
        })
    }

    #[inline]
    pub fn pgs_per_lun(&self) -> u32 {
        self.blks_per_pl * self.pgs_per_blk
    }

    #[inline]
    pub fn pgs_per_ch(&self) -> u32 {
        self.luns_per_ch * self.pgs_per_lun()
    }

    #[inline]
    pub fn tt_pgs(&self) -> u32 {
        self.nchs * self.pgs_per_ch()
    }

    #[inline]
    pub fn tt_grains(&self) -> u64 {
        u64::from(self.tt_pgs()) * GRAIN_PER_PAGE as u64
    }

    /// Total lines; equal to `blks_per_pl`.
    #[inline]
    pub fn tt_lines(&self) -> u32 {
        self.blks_per_pl
    }

    /// Parallel units (one block of every line per unit); the segment width
    /// of the block partition manager.
    #[inline]
    pub fn parallel_units(&self) -> u32 {
        self.nchs * self.luns_per_ch
    }

    #[inline]
    pub fn pgs_per_line(&self) -> u32 {
        self.parallel_units() * self.pgs_per_blk
    }

    #[inline]
    pub fn grains_per_line(&self) -> u32 {
        self.pgs_per_line() * GRAIN_PER_PAGE as u32
    }

    #[inline]
    pub fn flash_bytes(&self) -> u64 {
        u64::from(self.tt_pgs()) * PAGE_SIZE as u64
    }

    /// Decode a linear page index.
    pub fn ppa_parts(&self, ppa: Ppa) -> PpaParts {
        debug_assert!(ppa < self.tt_pgs());
        let pgs_per_ch = self.pgs_per_ch();
        let pgs_per_lun = self.pgs_per_lun();
        PpaParts {
            ch: ppa / pgs_per_ch,
            lun: (ppa % pgs_per_ch) / pgs_per_lun,
            pl: 0,
            blk: (ppa % pgs_per_lun) / self.pgs_per_blk,
            pg: ppa % self.pgs_per_blk,
        }
    }

    /// Encode a structured address back to a linear page index.
    pub fn parts_to_ppa(&self, p: PpaParts) -> Ppa {
        debug_assert!(p.ch < self.nchs);
        debug_assert!(p.lun < self.luns_per_ch);
        debug_assert!(p.blk < self.blks_per_pl);
        debug_assert!(p.pg < self.pgs_per_blk);
        p.ch * self.pgs_per_ch() + p.lun * self.pgs_per_lun() + p.blk * self.pgs_per_blk + p.pg
    }

    /// Line id owning `ppa`; lines are block-id aligned across units.
    #[inline]
    pub fn line_of(&self, ppa: Ppa) -> u32 {
        self.ppa_parts(ppa).blk
    }

    /// True when `pg` is the last page of its wordline.
    #[inline]
    pub fn last_pg_in_wordline(&self, pg: u32) -> bool {
        pg % self.pgs_per_wordline == self.pgs_per_wordline - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Geometry {
        Geometry::new(2, 2, 8, 8, 4).unwrap()
    }

    #[test]
    fn counts() {
        let g = small();
        assert_eq!(g.pgs_per_lun(), 64);
        assert_eq!(g.pgs_per_ch(), 128);
        assert_eq!(g.tt_pgs(), 256);
        assert_eq!(g.parallel_units(), 4);
        assert_eq!(g.pgs_per_line(), 32);
    }

    #[test]
    fn ppa_round_trip_covers_whole_device() {
        let g = small();
        for ppa in 0..g.tt_pgs() {
            let parts = g.ppa_parts(ppa);
            assert_eq!(g.parts_to_ppa(parts), ppa, "ppa {ppa} -> {parts:?}");
        }
    }

    #[test]
    fn structured_round_trip() {
        let g = small();
        for ch in 0..g.nchs {
            for lun in 0..g.luns_per_ch {
                for blk in 0..g.blks_per_pl {
                    for pg in 0..g.pgs_per_blk {
                        let parts = PpaParts { ch, lun, pl: 0, blk, pg };
                        assert_eq!(g.ppa_parts(g.parts_to_ppa(parts)), parts);
                    }
                }
            }
        }
    }

    #[test]
    fn rejects_bad_shapes() {
        assert_eq!(
            Geometry::new(0, 2, 8, 8, 4).unwrap_err(),
            GeometryError::ZeroDimension
        );
        assert_eq!(
            Geometry::new(2, 2, 8, 6, 4).unwrap_err(),
            GeometryError::WordlineMisaligned
        );
    }
}
