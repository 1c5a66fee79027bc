//! The soup: a fixed-size arena of signed bytes shared by every instruction
//! pointer, shaped as a torus of `dim_x` x `dim_y` cells.
//!
//! There is no cell-level synchronization. Every cell is an `AtomicI8`
//! accessed with `Relaxed` ordering, so concurrent writers race but each
//! individual byte read observes a value some writer actually stored. Wider
//! reads are composed from four independent byte reads and may mix versions.

use std::sync::atomic::{AtomicI8, Ordering};

use rand::prelude::*;

/// Wrap a signed value into `[0, m)` using mathematical (non-negative)
/// modulo, so -1 maps to m-1.
#[inline]
pub fn wrap(v: i32, m: i32) -> i32 {
    v.rem_euclid(m)
}

pub struct Soup {
    cells: Box<[AtomicI8]>,
    dim_x: i32,
    dim_y: i32,
}

impl Soup {
    /// Create a zeroed soup of `dim_x * dim_y` cells.
    pub fn new(dim_x: i32, dim_y: i32) -> Self {
        assert!(dim_x > 0 && dim_y > 0, "soup dimensions must be positive");
        let len = dim_x as usize * dim_y as usize;
        let cells: Box<[AtomicI8]> = (0..len).map(|_| AtomicI8::new(0)).collect();
        Self { cells, dim_x, dim_y }
    }

    /// Fill every cell with a uniform random signed byte.
    pub fn randomize(&self, rng: &mut StdRng) {
        for cell in self.cells.iter() {
            cell.store(rng.gen::<i8>(), Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn dim_x(&self) -> i32 {
        self.dim_x
    }

    #[inline]
    pub fn dim_y(&self) -> i32 {
        self.dim_y
    }

    /// Convert wrapped 2D coordinates to a linear index.
    #[inline]
    pub fn index(&self, x: i32, y: i32) -> usize {
        (wrap(y, self.dim_y) * self.dim_x + wrap(x, self.dim_x)) as usize
    }

    /// Read the signed byte at `(x, y)`, wrapping both coordinates.
    #[inline]
    pub fn get(&self, x: i32, y: i32) -> i8 {
        self.cells[self.index(x, y)].load(Ordering::Relaxed)
    }

    /// Write the signed byte at `(x, y)`, wrapping both coordinates.
    #[inline]
    pub fn set(&self, x: i32, y: i32, v: i8) {
        self.cells[self.index(x, y)].store(v, Ordering::Relaxed);
    }

    /// Read four vertically consecutive bytes starting at `(x, y)` as a
    /// signed big-endian 32-bit word. Each byte's coordinates wrap
    /// independently; the four loads are independent and may observe
    /// different concurrent writers.
    #[inline]
    pub fn get_wide(&self, x: i32, y: i32) -> i32 {
        let b0 = self.get(x, y) as u8;
        let b1 = self.get(x, y + 1) as u8;
        let b2 = self.get(x, y + 2) as u8;
        let b3 = self.get(x, y + 3) as u8;
        i32::from_be_bytes([b0, b1, b2, b3])
    }

    /// XOR one bit of the byte at linear index `i`.
    #[inline]
    pub fn flip_bit(&self, i: usize, bit: u32) {
        self.cells[i].fetch_xor(1 << bit, Ordering::Relaxed);
    }

    /// Copy the whole arena out as raw bytes. Reads are unsynchronized;
    /// the copy may interleave with concurrent writers.
    pub fn dump(&self) -> Vec<u8> {
        self.cells
            .iter()
            .map(|c| c.load(Ordering::Relaxed) as u8)
            .collect()
    }

    /// Overwrite the whole arena from raw bytes. The length must match.
    pub fn load(&self, bytes: &[u8]) -> Result<(), String> {
        if bytes.len() != self.cells.len() {
            return Err(format!(
                "soup length mismatch: got {}, expected {}",
                bytes.len(),
                self.cells.len()
            ));
        }
        for (cell, &b) in self.cells.iter().zip(bytes) {
            cell.store(b as i8, Ordering::Relaxed);
        }
        Ok(())
    }
}
