//! The virtual machine: one-byte instructions decoded and executed by
//! instruction pointers (IPs) roaming the shared soup.
//!
//! Instruction layout, high bit first:
//!
//! ```text
//! bits 7..4  opcode       high nibble, 1..=14; 0 and 15 are no-ops
//! bit  3     invert       bitwise-NOT the 32-bit result before storing
//! bits 2..1  dest_mode    east / west / self / indirect
//! bit  0     source_mode  0 = address, 1 = immediate
//! ```
//!
//! Arithmetic is 32-bit wrapping on sign-extended operands, truncated to the
//! low byte on store. The VM is total: undefined opcodes are no-ops, MOD by
//! zero yields 0, shift amounts are clamped to 31. No error escapes `step`.
//!
//! Note: some accessors are kept for API completeness even if not currently
//! used outside tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use rand::prelude::*;
use rand::rngs::SmallRng;

use crate::soup::{wrap, Soup};

/// The fourteen allocated opcodes, at high-nibble values 1..=14.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Mov,
    Add,
    Sub,
    Inc,
    Dec,
    Xor,
    And,
    Or,
    Shf,
    Jmp,
    Je,
    Jne,
    Mul,
    Mod,
}

impl Opcode {
    /// Decode a high nibble. Nibbles 0 and 15 are unallocated and decode to
    /// `None`; they execute as no-ops but the post-step walk still happens.
    pub fn from_nibble(n: u8) -> Option<Opcode> {
        match n {
            1 => Some(Opcode::Mov),
            2 => Some(Opcode::Add),
            3 => Some(Opcode::Sub),
            4 => Some(Opcode::Inc),
            5 => Some(Opcode::Dec),
            6 => Some(Opcode::Xor),
            7 => Some(Opcode::And),
            8 => Some(Opcode::Or),
            9 => Some(Opcode::Shf),
            10 => Some(Opcode::Jmp),
            11 => Some(Opcode::Je),
            12 => Some(Opcode::Jne),
            13 => Some(Opcode::Mul),
            14 => Some(Opcode::Mod),
            _ => None,
        }
    }
}

/// Where the computed result is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dest {
    /// `(x+1, y)`
    East,
    /// `(x-1, y)`
    West,
    /// `(x, y)`: the instruction byte itself
    Here,
    /// Address resolved from the byte(s) at the north-east site `(x+1, y-1)`
    Indirect,
}

impl Dest {
    #[inline]
    fn from_bits(b: u8) -> Dest {
        match b & 0b11 {
            0 => Dest::East,
            1 => Dest::West,
            2 => Dest::Here,
            _ => Dest::Indirect,
        }
    }
}

/// A decoded instruction byte.
#[derive(Clone, Copy, Debug)]
pub struct Instr {
    pub opcode: Option<Opcode>,
    pub invert: bool,
    pub dest: Dest,
    pub immediate: bool,
}

/// Decode a raw soup byte into its instruction fields.
#[inline]
pub fn decode(byte: i8) -> Instr {
    let b = byte as u8;
    Instr {
        opcode: Opcode::from_nibble(b >> 4),
        invert: b & 0b1000 != 0,
        dest: Dest::from_bits(b >> 1),
        immediate: b & 1 != 0,
    }
}

#[inline]
fn sext8(v: i32) -> i32 {
    v as u8 as i8 as i32
}

#[inline]
fn sext16(v: i32) -> i32 {
    v as u16 as i16 as i32
}

/// Resolve a signed offset against a base coordinate under the current
/// addressing mode, returning wrapped final coordinates.
///
/// 8-bit relative mode carries no Y component and is effectively
/// one-dimensional; 8-bit absolute mode forces Y = 0.
#[inline]
pub fn resolve_offset(
    soup: &Soup,
    base_x: i32,
    base_y: i32,
    offset: i32,
    wide: bool,
    relative: bool,
) -> (i32, i32) {
    let (fx, fy) = match (relative, wide) {
        (true, true) => (
            base_x.wrapping_add(sext16(offset)),
            base_y.wrapping_add(sext16(offset >> 16)),
        ),
        (true, false) => (base_x.wrapping_add(sext8(offset)), base_y),
        (false, true) => (offset & 0xFFFF, (offset >> 16) & 0xFFFF),
        (false, false) => (offset & 0xFF, 0),
    };
    (wrap(fx, soup.dim_x()), wrap(fy, soup.dim_y()))
}

/// The eight Moore-neighborhood offsets for the post-step random walk.
const MOORE: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// An instruction pointer: a 2D cursor into the soup with its own addressing
/// configuration and step counter.
///
/// Coordinates, the step counter, and the addressing flags are atomics so
/// the stats and frame emitters can read them while the owning worker runs;
/// all accesses use `Relaxed` ordering. Only the owning worker (or the
/// supervisor, between steps) moves the cursor.
pub struct Ip {
    id: u32,
    x: AtomicI32,
    y: AtomicI32,
    steps: AtomicU64,
    wide_addressing: AtomicBool,
    relative_addressing: AtomicBool,
}

/// The serializable projection of an IP, used only in snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SavableIp {
    pub id: u32,
    pub x: i32,
    pub y: i32,
    pub steps: u64,
    pub current_instruction_byte: i8,
}

impl Ip {
    pub fn new(id: u32, x: i32, y: i32, wide: bool, relative: bool) -> Self {
        Self {
            id,
            x: AtomicI32::new(x),
            y: AtomicI32::new(y),
            steps: AtomicU64::new(0),
            wide_addressing: AtomicBool::new(wide),
            relative_addressing: AtomicBool::new(relative),
        }
    }

    /// Reconstruct an IP from a snapshot entry, under the supervisor's
    /// current addressing configuration.
    pub fn from_saved(saved: &SavableIp, wide: bool, relative: bool) -> Self {
        let ip = Ip::new(saved.id, saved.x, saved.y, wide, relative);
        ip.steps.store(saved.steps, Ordering::Relaxed);
        ip
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn position(&self) -> (i32, i32) {
        (self.x.load(Ordering::Relaxed), self.y.load(Ordering::Relaxed))
    }

    pub fn set_position(&self, x: i32, y: i32) {
        self.x.store(x, Ordering::Relaxed);
        self.y.store(y, Ordering::Relaxed);
    }

    #[inline]
    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    pub fn set_wide_addressing(&self, enabled: bool) {
        self.wide_addressing.store(enabled, Ordering::Relaxed);
    }

    pub fn set_relative_addressing(&self, enabled: bool) {
        self.relative_addressing.store(enabled, Ordering::Relaxed);
    }

    pub fn wide_addressing(&self) -> bool {
        self.wide_addressing.load(Ordering::Relaxed)
    }

    pub fn relative_addressing(&self) -> bool {
        self.relative_addressing.load(Ordering::Relaxed)
    }

    pub fn savable(&self, soup: &Soup) -> SavableIp {
        let (x, y) = self.position();
        SavableIp {
            id: self.id,
            x,
            y,
            steps: self.steps(),
            current_instruction_byte: soup.get(x, y),
        }
    }

    /// One complete fetch-decode-execute-move cycle. The random walk is
    /// applied unconditionally, after taken jumps too, and both coordinates
    /// are wrapped before the step counter advances.
    pub fn step(&self, soup: &Soup, rng: &mut SmallRng) {
        self.execute(soup);
        self.drift(soup, rng);
        self.steps.fetch_add(1, Ordering::Relaxed);
    }

    /// Fetch, decode and execute the instruction under the cursor. A taken
    /// jump moves the cursor to its resolved target; nothing else moves it.
    pub fn execute(&self, soup: &Soup) {
        let wide = self.wide_addressing.load(Ordering::Relaxed);
        let relative = self.relative_addressing.load(Ordering::Relaxed);
        let x = self.x.load(Ordering::Relaxed);
        let y = self.y.load(Ordering::Relaxed);

        let instr = decode(soup.get(x, y));
        let op = match instr.opcode {
            Some(op) => op,
            None => return,
        };

        // Source 1 is the cell one west, source 2 one east. Each fetch is an
        // independent per-cell read.
        let fetch = |site_x: i32, site_y: i32| -> i32 {
            if instr.immediate {
                soup.get(site_x, site_y) as i32
            } else {
                let offset = if wide {
                    soup.get_wide(site_x, site_y)
                } else {
                    soup.get(site_x, site_y) as i32
                };
                let (fx, fy) = resolve_offset(soup, x, y, offset, wide, relative);
                soup.get(fx, fy) as i32
            }
        };

        match op {
            Opcode::Jmp => {
                let offset = fetch(x - 1, y);
                let (fx, fy) = resolve_offset(soup, x, y, offset, wide, relative);
                self.set_position(fx, fy);
                return;
            }
            Opcode::Je | Opcode::Jne => {
                let test = fetch(x - 1, y);
                let taken = if op == Opcode::Je { test == 0 } else { test != 0 };
                if taken {
                    let offset = fetch(x + 1, y);
                    let (fx, fy) = resolve_offset(soup, x, y, offset, wide, relative);
                    self.set_position(fx, fy);
                }
                return;
            }
            _ => {}
        }

        let src1 = fetch(x - 1, y);
        let mut result = match op {
            Opcode::Mov => src1,
            Opcode::Inc => src1.wrapping_add(1),
            Opcode::Dec => src1.wrapping_sub(1),
            Opcode::Add => src1.wrapping_add(fetch(x + 1, y)),
            Opcode::Sub => src1.wrapping_sub(fetch(x + 1, y)),
            Opcode::Xor => src1 ^ fetch(x + 1, y),
            Opcode::And => src1 & fetch(x + 1, y),
            Opcode::Or => src1 | fetch(x + 1, y),
            Opcode::Mul => src1.wrapping_mul(fetch(x + 1, y)),
            Opcode::Mod => {
                let src2 = fetch(x + 1, y);
                if src2 == 0 {
                    0
                } else {
                    src1.wrapping_rem(src2)
                }
            }
            Opcode::Shf => {
                // Shift amounts clamped to 31; negative amounts shift right
                // with sign extension.
                let src2 = fetch(x + 1, y);
                if src2 > 0 {
                    src1 << src2.min(31)
                } else {
                    src1 >> src2.unsigned_abs().min(31)
                }
            }
            Opcode::Jmp | Opcode::Je | Opcode::Jne => unreachable!(),
        };

        if instr.invert {
            result = !result;
        }

        let (dest_x, dest_y) = match instr.dest {
            Dest::East => (x + 1, y),
            Dest::West => (x - 1, y),
            Dest::Here => (x, y),
            Dest::Indirect => {
                let offset = if wide {
                    soup.get_wide(x + 1, y - 1)
                } else {
                    soup.get(x + 1, y - 1) as i32
                };
                resolve_offset(soup, x, y, offset, wide, relative)
            }
        };
        soup.set(dest_x, dest_y, result as i8);
    }

    /// Move the cursor by one uniformly chosen Moore-neighborhood offset and
    /// wrap both coordinates. This is the engine of diffusion: without it an
    /// IP stuck in a dead region could never escape.
    pub fn drift(&self, soup: &Soup, rng: &mut SmallRng) {
        let (dx, dy) = MOORE[rng.gen_range(0..MOORE.len())];
        let x = wrap(self.x.load(Ordering::Relaxed) + dx, soup.dim_x());
        let y = wrap(self.y.load(Ordering::Relaxed) + dy, soup.dim_y());
        self.set_position(x, y);
    }
}
