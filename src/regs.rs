//! Raw access to the QUADSPI register block. The driver in `qspi` only talks to the
//! peripheral through the [`QspiRegs`] trait, so it can run against the real registers,
//! or against the simulated peripheral in `sim`.
//!
//! Offsets and bit positions are from RM0431 (F72x/F73x) section 14.5, and are the same on
//! other families with the classic QUADSPI block (F74x-F77x, H74x/H75x, L4, G4).

/// A register in the QUADSPI block. The discriminant is the byte offset from the block base.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    /// Control register
    Cr = 0x00,
    /// Device configuration register
    Dcr = 0x04,
    /// Status register
    Sr = 0x08,
    /// Flag clear register
    Fcr = 0x0C,
    /// Data length register
    Dlr = 0x10,
    /// Communication configuration register
    Ccr = 0x14,
    /// Address register
    Ar = 0x18,
    /// Alternate bytes register
    Abr = 0x1C,
    /// Data register
    Dr = 0x20,
    /// Polling status mask register
    Psmkr = 0x24,
    /// Polling status match register
    Psmar = 0x28,
    /// Polling interval register
    Pir = 0x2C,
    /// Low-power timeout register
    Lptr = 0x30,
}

impl Reg {
    pub const fn offset(self) -> usize {
        self as usize
    }
}

/// `QUADSPI_CR` fields.
pub mod cr {
    pub const EN: u32 = 1 << 0;
    pub const ABORT: u32 = 1 << 1;
    pub const SSHIFT: u32 = 1 << 4;
    pub const FTHRES_POS: u32 = 8;
    pub const FTHRES_MASK: u32 = 0xF << FTHRES_POS;
    /// Automatic poll mode stop: end the transaction on the first match.
    pub const APMS: u32 = 1 << 22;
    /// Polling match mode. 0: AND (all masked bits match). 1: OR.
    pub const PMM: u32 = 1 << 23;
    pub const PRESCALER_POS: u32 = 24;
    pub const PRESCALER_MASK: u32 = 0xFF << PRESCALER_POS;
}

/// `QUADSPI_DCR` fields.
pub mod dcr {
    pub const FSIZE_POS: u32 = 16;
    pub const FSIZE_MASK: u32 = 0x1F << FSIZE_POS;
}

/// `QUADSPI_SR` fields.
pub mod sr {
    /// Transfer error
    pub const TEF: u32 = 1 << 0;
    /// Transfer complete
    pub const TCF: u32 = 1 << 1;
    /// Status match
    pub const SMF: u32 = 1 << 3;
    pub const BUSY: u32 = 1 << 5;
    pub const FLEVEL_POS: u32 = 8;
    pub const FLEVEL_MASK: u32 = 0x3F << FLEVEL_POS;
}

/// `QUADSPI_FCR` fields. Writing 1 clears the matching `SR` flag.
pub mod fcr {
    pub const CTEF: u32 = 1 << 0;
    pub const CTCF: u32 = 1 << 1;
    pub const CSMF: u32 = 1 << 3;
}

/// `QUADSPI_CCR` fields.
pub mod ccr {
    pub const INSTRUCTION_MASK: u32 = 0xFF;
    pub const IMODE_POS: u32 = 8;
    pub const ADMODE_POS: u32 = 10;
    pub const ADSIZE_POS: u32 = 12;
    pub const ABMODE_POS: u32 = 14;
    pub const DCYC_POS: u32 = 18;
    pub const DCYC_MASK: u32 = 0x1F << DCYC_POS;
    pub const DMODE_POS: u32 = 24;
    pub const FMODE_POS: u32 = 26;
    /// Width of the 2-bit IMODE, ADMODE, ADSIZE, ABMODE, DMODE and FMODE fields.
    pub const FIELD2_MASK: u32 = 0b11;
}

/// The register file of one QUADSPI peripheral.
///
/// Register writes have the same side effects as on hardware: writing `CCR`, `AR` or `DR`
/// can start a transaction, depending on the phases configured.
pub trait QspiRegs {
    /// Read a full 32-bit register.
    fn read(&mut self, reg: Reg) -> u32;

    /// Write a full 32-bit register.
    fn write(&mut self, reg: Reg, val: u32);

    /// Read a single byte from a register; used to pull bytes out of the `DR` FIFO.
    fn read_u8(&mut self, reg: Reg) -> u8;

    /// Write a single byte to a register; used to push bytes into the `DR` FIFO.
    fn write_u8(&mut self, reg: Reg, val: u8);

    /// Load bytes from the memory-mapped window, starting `offset` bytes past its base.
    fn read_mapped(&mut self, offset: u32, buf: &mut [u8]);

    /// Make sure register writes have landed before the next memory access. Called after
    /// enabling memory-mapped mode.
    fn barrier(&mut self) {}
}

#[cfg(pac_regs)]
mod pac_impl {
    use core::ptr;

    use super::{QspiRegs, Reg};
    use crate::pac::QUADSPI;

    /// Start of the memory-mapped window. Bank 1 on F7 and H7.
    pub const MEM_MAPPED_BASE_ADDR: usize = 0x9000_0000;

    impl QspiRegs for QUADSPI {
        fn read(&mut self, reg: Reg) -> u32 {
            match reg {
                Reg::Cr => self.cr().read().bits(),
                Reg::Dcr => self.dcr().read().bits(),
                Reg::Sr => self.sr().read().bits(),
                // Write-only.
                Reg::Fcr => 0,
                Reg::Dlr => self.dlr().read().bits(),
                Reg::Ccr => self.ccr().read().bits(),
                Reg::Ar => self.ar().read().bits(),
                Reg::Abr => self.abr().read().bits(),
                Reg::Dr => self.dr().read().bits(),
                Reg::Psmkr => self.psmkr().read().bits(),
                Reg::Psmar => self.psmar().read().bits(),
                Reg::Pir => self.pir().read().bits(),
                Reg::Lptr => self.lptr().read().bits(),
            }
        }

        fn write(&mut self, reg: Reg, val: u32) {
            match reg {
                Reg::Cr => {
                    self.cr().write(|w| unsafe { w.bits(val) });
                }
                Reg::Dcr => {
                    self.dcr().write(|w| unsafe { w.bits(val) });
                }
                // Read-only.
                Reg::Sr => {}
                Reg::Fcr => {
                    self.fcr().write(|w| unsafe { w.bits(val) });
                }
                Reg::Dlr => {
                    self.dlr().write(|w| unsafe { w.bits(val) });
                }
                Reg::Ccr => {
                    self.ccr().write(|w| unsafe { w.bits(val) });
                }
                Reg::Ar => {
                    self.ar().write(|w| unsafe { w.bits(val) });
                }
                Reg::Abr => {
                    self.abr().write(|w| unsafe { w.bits(val) });
                }
                Reg::Dr => {
                    self.dr().write(|w| unsafe { w.bits(val) });
                }
                Reg::Psmkr => {
                    self.psmkr().write(|w| unsafe { w.bits(val) });
                }
                Reg::Psmar => {
                    self.psmar().write(|w| unsafe { w.bits(val) });
                }
                Reg::Pir => {
                    self.pir().write(|w| unsafe { w.bits(val) });
                }
                Reg::Lptr => {
                    self.lptr().write(|w| unsafe { w.bits(val) });
                }
            }
        }

        fn read_u8(&mut self, reg: Reg) -> u8 {
            match reg {
                // Byte access to DR pops a single byte from the FIFO.
                Reg::Dr => unsafe { ptr::read_volatile(self.dr().as_ptr() as *const u8) },
                _ => self.read(reg) as u8,
            }
        }

        fn write_u8(&mut self, reg: Reg, val: u8) {
            match reg {
                Reg::Dr => unsafe { ptr::write_volatile(self.dr().as_ptr() as *mut u8, val) },
                _ => self.write(reg, val as u32),
            }
        }

        fn read_mapped(&mut self, offset: u32, buf: &mut [u8]) {
            let base = (MEM_MAPPED_BASE_ADDR + offset as usize) as *const u8;
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = unsafe { ptr::read_volatile(base.add(i)) };
            }
        }

        fn barrier(&mut self) {
            cortex_m::asm::dsb();
            cortex_m::asm::isb();
        }
    }
}

#[cfg(pac_regs)]
pub use pac_impl::MEM_MAPPED_BASE_ADDR;

#[cfg(all(test, pac_regs))]
mod tests {
    use super::*;
    use crate::pac::QUADSPI;

    fn offset_of(ptr: *mut u32) -> usize {
        ptr as usize - QUADSPI::ptr() as usize
    }

    #[test]
    fn offsets_match_pac_layout() {
        // Only addresses are computed here; no register is accessed.
        let qspi = unsafe { QUADSPI::steal() };

        assert_eq!(offset_of(qspi.cr().as_ptr()), Reg::Cr.offset());
        assert_eq!(offset_of(qspi.sr().as_ptr()), Reg::Sr.offset());
        assert_eq!(offset_of(qspi.ccr().as_ptr()), Reg::Ccr.offset());
        assert_eq!(offset_of(qspi.dr().as_ptr()), Reg::Dr.offset());
        assert_eq!(offset_of(qspi.pir().as_ptr()), Reg::Pir.offset());
        assert_eq!(offset_of(qspi.lptr().as_ptr()), Reg::Lptr.offset());
    }
}
