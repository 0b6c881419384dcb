use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::bytecode::op::{GENERAL_REGISTERS, Operand, Reg, Slice, Width};

/// Occupied bytes per general register, one bit per byte.
type Occupancy = Rc<RefCell<[u8; GENERAL_REGISTERS]>>;

/// Tracks which slices of `r0`..`r7` are handed out.
///
/// There is no spilling: running out of registers is a code generation bug.
#[derive(Debug, Default)]
pub struct RegisterFile {
    used: Occupancy,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the first free slice of `width`, scanning `r0` upward; byte
    /// requests try `b0` before `b1`.
    ///
    /// # Panics
    ///
    /// Panics if every candidate slice overlaps a live ticket.
    pub fn get_free(&self, width: Width) -> Ticket {
        let mut used = self.used.borrow_mut();
        for n in 0..GENERAL_REGISTERS {
            for &slice in Slice::candidates(width) {
                if used[n] & slice.byte_mask() == 0 {
                    used[n] |= slice.byte_mask();
                    let reg = Reg::R(n as u8);
                    trace!(%reg, ?slice, "register acquired");
                    return Ticket {
                        reg,
                        slice,
                        used: Rc::clone(&self.used),
                    };
                }
            }
        }
        panic!(
            "internal error: no free register for a {}-bit value",
            width.bits()
        );
    }

    /// Whether any ticket is outstanding.
    pub fn in_use(&self) -> bool {
        self.used.borrow().iter().any(|bytes| *bytes != 0)
    }
}

/// A claimed register slice; released when dropped.
#[derive(Debug)]
pub struct Ticket {
    reg: Reg,
    slice: Slice,
    used: Occupancy,
}

impl Ticket {
    pub fn reg(&self) -> Reg {
        self.reg
    }

    pub fn slice(&self) -> Slice {
        self.slice
    }

    pub fn width(&self) -> Width {
        self.slice.width()
    }

    /// The claimed slice as an operand.
    pub fn operand(&self) -> Operand {
        Operand::reg(self.reg, self.slice)
    }

    /// A narrower view of a full-width ticket (low bits).
    pub fn low(&self, width: Width) -> Operand {
        debug_assert!(width <= self.width() && self.slice.shift() == 0);
        Operand::reg(self.reg, Slice::full(width))
    }

    /// Memory at `reg + offset`, for pointer-holding tickets.
    pub fn mem(&self, offset: i32, width: Width) -> Operand {
        Operand::mem(self.reg, offset, width)
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Reg::R(n) = self.reg {
            self.used.borrow_mut()[n as usize] &= !self.slice.byte_mask();
            trace!(reg = %self.reg, slice = ?self.slice, "register released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_order() {
        let regs = RegisterFile::new();
        let a = regs.get_free(Width::W64);
        let b = regs.get_free(Width::W32);
        assert_eq!(a.reg(), Reg::R(0));
        assert_eq!(b.reg(), Reg::R(1));
        assert_eq!(b.slice(), Slice::D);
    }

    #[test]
    fn test_byte_halves_share_register() {
        let regs = RegisterFile::new();
        let lo = regs.get_free(Width::W8);
        let hi = regs.get_free(Width::W8);
        assert_eq!((lo.reg(), lo.slice()), (Reg::R(0), Slice::B0));
        assert_eq!((hi.reg(), hi.slice()), (Reg::R(0), Slice::B1));

        // a word overlaps both halves
        let word = regs.get_free(Width::W16);
        assert_eq!(word.reg(), Reg::R(1));
    }

    #[test]
    fn test_release_on_drop() {
        let regs = RegisterFile::new();
        {
            let _t = regs.get_free(Width::W64);
            assert!(regs.in_use());
        }
        assert!(!regs.in_use());
        assert_eq!(regs.get_free(Width::W16).reg(), Reg::R(0));
    }

    #[test]
    fn test_full_width_conflicts_with_byte() {
        let regs = RegisterFile::new();
        let hi_free = {
            let _byte = regs.get_free(Width::W8);
            regs.get_free(Width::W64).reg()
        };
        assert_eq!(hi_free, Reg::R(1));
    }

    #[test]
    #[should_panic(expected = "no free register")]
    fn test_exhaustion_panics() {
        let regs = RegisterFile::new();
        let _held: Vec<Ticket> = (0..=GENERAL_REGISTERS)
            .map(|_| regs.get_free(Width::W32))
            .collect();
    }

    #[test]
    fn test_low_view() {
        let regs = RegisterFile::new();
        let t = regs.get_free(Width::W64);
        assert_eq!(t.low(Width::W16), Operand::reg(Reg::R(0), Slice::W));
    }
}
