//! Command sequences for an external Macronix MX25L51245G (512Mbit) NOR flash, run over
//! QUADSPI: quad (QPI) mode entry, 4-byte addressing, write enable, 4KB sector erase,
//! word programming, and the switch to memory-mapped reads.
//!
//! Bring-up order is fixed: [`QspiFlash::enter_quad_mode`], then
//! [`QspiFlash::enable_4byte_addressing`], then optionally erase and program, then
//! [`QspiFlash::enter_memory_mapped`]. [`QspiFlash::activate`] runs the required steps.

use core::fmt;

use embedded_hal::delay::DelayNs;

use crate::{
    error::Result,
    qspi::{AddressSize, Command, FunctionalMode, ProtocolMode, Qspi, StatusPoll},
    regs::QspiRegs,
};

/// Erase granularity, in bytes.
pub const SECTOR_SIZE: u32 = 4_096;

/// Flash instructions.
pub mod opcode {
    pub const WRITE_ENABLE: u8 = 0x06;
    /// 4KB sector erase.
    pub const SECTOR_ERASE: u8 = 0x20;
    /// Page program, always with a 4-byte address.
    pub const PAGE_PROGRAM_4B: u8 = 0x12;
    /// Enter QPI mode: all further instructions use 4 lines.
    pub const ENTER_QPI: u8 = 0x35;
    pub const ENTER_4BYTE: u8 = 0xB7;
    /// Quad I/O fast read, with a 4-byte address.
    pub const FAST_READ_QUAD_4B: u8 = 0xEC;
    pub const READ_STATUS: u8 = 0x05;
    pub const READ_CONFIG: u8 = 0x15;
}

/// Status register bits.
pub mod status {
    /// Write in progress
    pub const WIP: u8 = 1 << 0;
    /// Write enable latch
    pub const WEL: u8 = 1 << 1;
    /// Quad enable
    pub const QE: u8 = 1 << 6;
}

/// Configuration register bits.
pub mod config {
    /// 4-byte addressing enabled
    pub const FOUR_BYTE: u8 = 1 << 5;
}

/// Chip registers readable with [`QspiFlash::read_status`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum StatusRegister {
    Status = opcode::READ_STATUS,
    Config = opcode::READ_CONFIG,
}

/// Possible error states for flash operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// The chip hasn't been switched to quad (QPI) mode.
    QuadModeDisabled,
    /// The chip hasn't been switched to 4-byte addressing.
    FourByteAddressingDisabled,
    /// Sector index too large to form an address.
    OutOfRange,
}

/// Mode changes confirmed on the chip this session. Neither can be undone.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChipState {
    pub quad: bool,
    pub four_byte: bool,
}

/// The flash chip, attached to a QUADSPI peripheral.
pub struct QspiFlash<R> {
    pub qspi: Qspi<R>,
    state: ChipState,
}

impl<R: QspiRegs> QspiFlash<R> {
    /// The chip is assumed to be fresh from power-on: SPI mode, 3-byte addresses.
    pub fn new(qspi: Qspi<R>) -> Self {
        Self {
            qspi,
            state: ChipState::default(),
        }
    }

    pub fn state(&self) -> ChipState {
        self.state
    }

    pub fn free(self) -> Qspi<R> {
        self.qspi
    }

    fn require_quad(&self) -> Result<()> {
        if !self.state.quad {
            return Err(FlashError::QuadModeDisabled.into());
        }
        Ok(())
    }

    /// Address width the chip currently expects for 3/4-byte-agnostic commands.
    fn address_size(&self) -> AddressSize {
        if self.state.four_byte {
            AddressSize::A32
        } else {
            AddressSize::A24
        }
    }

    /// Switch the chip to QPI mode, and wait for the quad enable bit.
    pub fn enter_quad_mode(&mut self) -> Result<()> {
        // The chip is still in SPI mode, so this instruction goes out on one line only.
        let cmd = Command::new(
            FunctionalMode::IndirectWrite,
            opcode::ENTER_QPI,
            ProtocolMode::Single,
        );
        self.qspi.command(&cmd)?;

        self.qspi.poll_status(&StatusPoll::new(
            opcode::READ_STATUS,
            status::QE | status::WIP,
            status::QE,
        ))?;

        self.state.quad = true;

        #[cfg(feature = "defmt")]
        defmt::debug!("Flash in QPI mode");

        Ok(())
    }

    /// Switch the chip to 32-bit addresses. Requires QPI mode; this instruction is only sent
    /// on 4 lines.
    pub fn enable_4byte_addressing(&mut self) -> Result<()> {
        self.require_quad()?;

        let cmd = Command::new(
            FunctionalMode::IndirectWrite,
            opcode::ENTER_4BYTE,
            ProtocolMode::Quad,
        );
        self.qspi.command(&cmd)?;

        self.qspi.poll_status(&StatusPoll::new(
            opcode::READ_CONFIG,
            config::FOUR_BYTE,
            config::FOUR_BYTE,
        ))?;

        self.state.four_byte = true;

        #[cfg(feature = "defmt")]
        defmt::debug!("Flash using 4-byte addresses");

        Ok(())
    }

    /// Enable writes on the flash. The latch clears itself after one erase or program,
    /// so this runs before each of them.
    pub fn write_enable(&mut self) -> Result<()> {
        self.require_quad()?;

        let cmd = Command::new(
            FunctionalMode::IndirectWrite,
            opcode::WRITE_ENABLE,
            ProtocolMode::Quad,
        );
        self.qspi.command(&cmd)?;

        // Wait until 'writes enabled' is set, and nothing's in progress.
        self.qspi.poll_status(&StatusPoll::new(
            opcode::READ_STATUS,
            status::QE | status::WEL | status::WIP,
            status::QE | status::WEL,
        ))
    }

    /// Erase a 4KB sector, at address `index * 4096`. Erased bytes read as `0xFF`.
    /// Whether the sector exists is left to the chip.
    pub fn erase_sector(&mut self, index: u32) -> Result<()> {
        self.require_quad()?;
        let addr = index
            .checked_mul(SECTOR_SIZE)
            .ok_or(FlashError::OutOfRange)?;

        self.write_enable()?;

        let cmd = Command::new(
            FunctionalMode::IndirectWrite,
            opcode::SECTOR_ERASE,
            ProtocolMode::Quad,
        )
        .address(addr, self.address_size(), ProtocolMode::Quad);
        self.qspi.command(&cmd)?;

        #[cfg(feature = "defmt")]
        defmt::debug!("Erasing sector {}", index);

        // The erase is done once 'write in progress', and the write enable latch are clear.
        self.qspi.poll_status(&StatusPoll::new(
            opcode::READ_STATUS,
            status::QE | status::WEL | status::WIP,
            status::QE,
        ))
    }

    /// Program one 4-byte word at `addr`. The word is sent least-significant byte first, so it
    /// reads back unchanged with a 32-bit load from the mapped window. Programming can only
    /// clear bits; the target must already be erased.
    pub fn write_word(&mut self, addr: u32, word: u32) -> Result<()> {
        self.require_quad()?;
        self.write_enable()?;

        let cmd = Command::new(
            FunctionalMode::IndirectWrite,
            opcode::PAGE_PROGRAM_4B,
            ProtocolMode::Quad,
        )
        .address(addr, AddressSize::A32, ProtocolMode::Quad)
        .data(ProtocolMode::Quad);
        self.qspi.write_indirect(&cmd, &word.to_le_bytes())?;

        self.qspi.poll_status(&StatusPoll::new(
            opcode::READ_STATUS,
            status::QE | status::WIP,
            status::QE,
        ))
    }

    /// Read one of the chip's status registers.
    pub fn read_status(&mut self, reg: StatusRegister) -> Result<u8> {
        self.require_quad()?;

        let cmd = Command::new(FunctionalMode::IndirectRead, reg as u8, ProtocolMode::Quad)
            .data(ProtocolMode::Quad);
        let mut buf = [0];
        self.qspi.read_indirect(&cmd, &mut buf)?;
        Ok(buf[0])
    }

    /// Set up continuous quad reads, and hand the flash over to memory-mapped mode. Both
    /// mode changes must be done first. Waits `mapped_settle_ns` before returning; the first
    /// access right after enabling has been seen to fail.
    pub fn enter_memory_mapped<D: DelayNs>(&mut self, delay: &mut D) -> Result<()> {
        self.require_quad()?;
        if !self.state.four_byte {
            return Err(FlashError::FourByteAddressingDisabled.into());
        }

        let cmd = Command::new(
            FunctionalMode::MemoryMapped,
            opcode::FAST_READ_QUAD_4B,
            ProtocolMode::Quad,
        )
        .address(0, AddressSize::A32, ProtocolMode::Quad)
        .data(ProtocolMode::Quad)
        .dummy_cycles(self.qspi.cfg.dummy_cycles);
        self.qspi.memory_mapped(&cmd)?;

        delay.delay_ns(self.qspi.cfg.mapped_settle_ns);
        Ok(())
    }

    /// Bring the flash from power-on to memory-mapped mode.
    pub fn activate<D: DelayNs>(&mut self, delay: &mut D) -> Result<()> {
        self.enter_quad_mode()?;
        self.enable_4byte_addressing()?;
        self.enter_memory_mapped(delay)
    }

    /// Load a word through the memory-mapped window. `offset` doesn't need to be aligned.
    pub fn read_mapped_u32(&mut self, offset: u32) -> Result<u32> {
        let mut buf = [0; 4];
        self.qspi.read_mapped(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Print the mapped word at each offset, eg `QSPI[8]: 0x01234567`.
    pub fn report<W: fmt::Write>(&mut self, out: &mut W, offsets: &[u32]) -> Result<()> {
        for &offset in offsets {
            let val = self.read_mapped_u32(offset)?;
            write!(out, "QSPI[{}]: 0x{:08X}\r\n", offset, val)?;
        }
        Ok(())
    }
}
