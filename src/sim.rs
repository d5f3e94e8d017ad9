//! A simulated QUADSPI peripheral, with an MX25L51245G attached. Used to run the driver and
//! the flash command sequences off-target.
//!
//! The peripheral model covers the register-level behavior the driver relies on. A write to
//! `CCR`, `AR` or `DR` starts a transaction depending on the phases configured, and status
//! polling, `ABORT` and the `SR` flags behave as on hardware. Time advances one step on each
//! `SR` read. Every transaction started is recorded in [`SimQspi::log`].
//!
//! The chip model accepts a command only if it arrives on the lines its current mode expects
//! (1 line in SPI mode, 4 in QPI mode), with the address width it expects.

use std::collections::VecDeque;

use crate::{
    flash::{SECTOR_SIZE, config, opcode, status},
    qspi::{AddressSize, FunctionalMode, ProtocolMode},
    regs::{QspiRegs, Reg, ccr, cr, fcr, sr},
};

/// Status reads that see `WIP` after a sector erase.
pub const ERASE_POLLS: u32 = 3;
/// Status reads that see `WIP` after a page program.
pub const PROGRAM_POLLS: u32 = 1;
/// Dummy cycles the chip needs for a quad I/O fast read at full speed.
pub const READ_DUMMY_CYCLES: u8 = 6;
const PAGE_SIZE: usize = 256;

/// One transaction, as seen on the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// `CCR` when the transaction started.
    pub ccr: u32,
    pub address: Option<u32>,
    /// Bytes written, or bytes returned for reads.
    pub data: Vec<u8>,
    /// The chip understood, and acted on the command.
    pub accepted: bool,
    /// Last value read by automatic status polling.
    pub polled: Option<u8>,
    /// Number of status reads made by automatic polling.
    pub polls: u32,
    /// Ended with `CR.ABORT`.
    pub aborted: bool,
}

impl Transaction {
    fn new(ccr: u32, address: Option<u32>) -> Self {
        Self {
            ccr,
            address,
            data: Vec::new(),
            accepted: false,
            polled: None,
            polls: 0,
            aborted: false,
        }
    }

    pub fn instruction(&self) -> u8 {
        (self.ccr & ccr::INSTRUCTION_MASK) as u8
    }

    pub fn instruction_mode(&self) -> ProtocolMode {
        ProtocolMode::from_bits(self.ccr >> ccr::IMODE_POS)
    }

    pub fn address_mode(&self) -> ProtocolMode {
        ProtocolMode::from_bits(self.ccr >> ccr::ADMODE_POS)
    }

    pub fn address_size(&self) -> AddressSize {
        AddressSize::from_bits(self.ccr >> ccr::ADSIZE_POS)
    }

    pub fn data_mode(&self) -> ProtocolMode {
        ProtocolMode::from_bits(self.ccr >> ccr::DMODE_POS)
    }

    pub fn functional_mode(&self) -> FunctionalMode {
        FunctionalMode::from_bits(self.ccr >> ccr::FMODE_POS)
    }

    pub fn dummy_cycles(&self) -> u8 {
        ((self.ccr & ccr::DCYC_MASK) >> ccr::DCYC_POS) as u8
    }
}

/// The flash chip.
#[derive(Clone, Debug)]
pub struct SimChip {
    pub memory: Vec<u8>,
    /// QPI mode: all phases use 4 lines.
    pub qpi: bool,
    pub four_byte: bool,
    /// Write enable latch.
    pub wel: bool,
    /// Remaining status reads that report write in progress.
    pub wip_polls: u32,
    /// Never finish an erase or program.
    pub stuck: bool,
}

impl SimChip {
    /// An erased chip, fresh from power-on.
    pub fn new(size: usize) -> Self {
        Self {
            memory: vec![0xFF; size],
            qpi: false,
            four_byte: false,
            wel: false,
            wip_polls: 0,
            stuck: false,
        }
    }

    /// Status register value, without side effects.
    pub fn status(&self) -> u8 {
        let mut val = 0;
        if self.qpi {
            val |= status::QE;
        }
        if self.wel {
            val |= status::WEL;
        }
        if self.wip_polls > 0 {
            val |= status::WIP;
        }
        val
    }

    /// Configuration register value.
    pub fn config(&self) -> u8 {
        if self.four_byte { config::FOUR_BYTE } else { 0 }
    }

    fn lines_ok(&self, t: &Transaction) -> bool {
        let expected = if self.qpi {
            ProtocolMode::Quad
        } else {
            ProtocolMode::Single
        };
        let phase_ok = |mode: ProtocolMode| mode == ProtocolMode::None || mode == expected;

        t.instruction_mode() == expected && phase_ok(t.address_mode()) && phase_ok(t.data_mode())
    }

    fn address_size(&self) -> AddressSize {
        if self.four_byte {
            AddressSize::A32
        } else {
            AddressSize::A24
        }
    }

    fn offset(&self, addr: u32) -> usize {
        addr as usize % self.memory.len()
    }

    /// Run a command with no data returned. Returns whether the chip accepted it.
    fn execute(&mut self, t: &Transaction) -> bool {
        // Everything but status reads is ignored during an erase or program.
        if !self.lines_ok(t) || self.wip_polls > 0 {
            return false;
        }

        match (t.instruction(), t.address) {
            (opcode::ENTER_QPI, None) if !self.qpi => self.qpi = true,
            (opcode::WRITE_ENABLE, None) => self.wel = true,
            (opcode::ENTER_4BYTE, None) => self.four_byte = true,
            (opcode::SECTOR_ERASE, Some(addr))
                if self.wel && t.address_size() == self.address_size() && t.data.is_empty() =>
            {
                let start = self.offset(addr) & !(SECTOR_SIZE as usize - 1);
                self.memory[start..start + SECTOR_SIZE as usize].fill(0xFF);
                self.wel = false;
                self.wip_polls = ERASE_POLLS;
            }
            (opcode::PAGE_PROGRAM_4B, Some(addr))
                if self.wel && t.address_size() == AddressSize::A32 && !t.data.is_empty() =>
            {
                // Programming only clears bits, and wraps within the page.
                let offset = self.offset(addr);
                let page = offset & !(PAGE_SIZE - 1);
                for (i, byte) in t.data.iter().enumerate() {
                    let pos = page + (offset + i) % PAGE_SIZE;
                    self.memory[pos] &= *byte;
                }
                self.wel = false;
                self.wip_polls = PROGRAM_POLLS;
            }
            _ => return false,
        }
        true
    }

    /// Read one status register. Returns `None` if the command wasn't understood; the data
    /// lines then float high.
    fn read_register(&mut self, t: &Transaction) -> Option<u8> {
        if !self.lines_ok(t) || t.address.is_some() {
            return None;
        }

        match t.instruction() {
            opcode::READ_STATUS => {
                let val = self.status();
                if self.wip_polls > 0 && !self.stuck {
                    self.wip_polls -= 1;
                }
                Some(val)
            }
            opcode::READ_CONFIG => Some(self.config()),
            _ => None,
        }
    }

    fn fast_read_ok(&self, t: &Transaction) -> bool {
        t.instruction() == opcode::FAST_READ_QUAD_4B
            && self.qpi
            && self.lines_ok(t)
            && t.address_mode() != ProtocolMode::None
            && t.address_size() == AddressSize::A32
            && t.data_mode() != ProtocolMode::None
            && t.dummy_cycles() == READ_DUMMY_CYCLES
    }

    /// Run a read command. Returns `None` if it wasn't understood.
    fn read(&mut self, t: &Transaction, len: usize) -> Option<Vec<u8>> {
        if t.instruction() == opcode::FAST_READ_QUAD_4B {
            if !self.fast_read_ok(t) || self.wip_polls > 0 {
                return None;
            }
            let start = self.offset(t.address.unwrap_or(0));
            return Some(
                (0..len)
                    .map(|i| self.memory[(start + i) % self.memory.len()])
                    .collect(),
            );
        }

        // Status registers are sent repeatedly for as long as the clock runs.
        let val = self.read_register(t)?;
        Some(vec![val; len])
    }
}

/// What the peripheral is doing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Activity {
    Idle,
    /// Clocking out an indirect write; `SR` reads left until it's done.
    Writing(u32),
    /// Indirect read done; busy until the FIFO is drained.
    Reading,
    /// Automatic status polling, for the log entry at this index.
    Polling(usize),
}

/// The simulated QUADSPI register file.
pub struct SimQspi {
    pub chip: SimChip,
    /// Every transaction started, in order.
    pub log: Vec<Transaction>,
    /// `SR` reads an indirect write stays busy for.
    pub write_latency: u32,
    /// Indirect reads never complete.
    pub stall_reads: bool,
    /// Bytes of each indirect read that never reach the FIFO.
    pub read_shortfall: usize,
    regs: [u32; 13],
    /// `TEF`, `TCF` and `SMF`.
    flags: u32,
    fifo: VecDeque<u8>,
    activity: Activity,
}

enum Trigger {
    Ccr,
    Ar,
    Dr,
}

impl SimQspi {
    /// A peripheral in its reset state, with an erased chip of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            chip: SimChip::new(size),
            log: Vec::new(),
            write_latency: 2,
            stall_reads: false,
            read_shortfall: 0,
            regs: [0; 13],
            flags: 0,
            fifo: VecDeque::new(),
            activity: Activity::Idle,
        }
    }

    /// Register value, without the side effects of a bus read.
    pub fn reg(&self, reg: Reg) -> u32 {
        match reg {
            Reg::Sr => self.sr(),
            _ => self.regs[reg.offset() / 4],
        }
    }

    fn set(&mut self, reg: Reg, val: u32) {
        self.regs[reg.offset() / 4] = val;
    }

    fn sr(&self) -> u32 {
        let mut val = self.flags;
        if self.activity != Activity::Idle {
            val |= sr::BUSY;
        }
        val | (((self.fifo.len() as u32) << sr::FLEVEL_POS) & sr::FLEVEL_MASK)
    }

    fn enabled(&self) -> bool {
        self.reg(Reg::Cr) & cr::EN != 0
    }

    fn busy(&self) -> bool {
        self.activity != Activity::Idle
    }

    /// Bytes in the data phase of the current transaction.
    fn data_len(&self) -> usize {
        self.reg(Reg::Dlr) as usize + 1
    }

    /// Advance one step.
    fn tick(&mut self) {
        match self.activity {
            Activity::Writing(remaining) => {
                if remaining <= 1 {
                    self.activity = Activity::Idle;
                    self.flags |= sr::TCF;
                } else {
                    self.activity = Activity::Writing(remaining - 1);
                }
            }
            Activity::Polling(i) => self.poll_step(i),
            Activity::Idle | Activity::Reading => (),
        }
    }

    fn poll_step(&mut self, i: usize) {
        let val = self.chip.read_register(&self.log[i]);

        let entry = &mut self.log[i];
        entry.accepted = val.is_some();
        let val = val.unwrap_or(0xFF);
        entry.polled = Some(val);
        entry.polls += 1;

        let mask = self.reg(Reg::Psmkr) as u8;
        let matches = self.reg(Reg::Psmar) as u8;
        let cr_val = self.reg(Reg::Cr);

        let matched = if cr_val & cr::PMM == 0 {
            val & mask == matches & mask
        } else {
            !(val ^ matches) & mask != 0
        };

        if matched {
            self.flags |= sr::SMF;
            if cr_val & cr::APMS != 0 {
                self.activity = Activity::Idle;
            }
        }
    }

    /// Start a transaction if `trigger` is the write that starts one for the phases in `CCR`.
    fn try_start(&mut self, trigger: Trigger) {
        if !self.enabled() || self.busy() {
            return;
        }

        let ccr_val = self.reg(Reg::Ccr);
        let pending = Transaction::new(ccr_val, None);
        let has_address = pending.address_mode() != ProtocolMode::None;
        let has_data = pending.data_mode() != ProtocolMode::None;

        let start = match (pending.functional_mode(), trigger) {
            (FunctionalMode::MemoryMapped, _) => false,
            (FunctionalMode::IndirectWrite, Trigger::Ccr) => !has_address && !has_data,
            (FunctionalMode::IndirectWrite, Trigger::Ar) => !has_data,
            (FunctionalMode::IndirectWrite, Trigger::Dr) => {
                has_data && self.fifo.len() >= self.data_len()
            }
            (_, Trigger::Ccr) => !has_address,
            (_, Trigger::Ar) => true,
            (_, Trigger::Dr) => false,
        };
        if !start {
            return;
        }

        let address = has_address.then(|| self.reg(Reg::Ar));
        let mut t = Transaction::new(ccr_val, address);

        match t.functional_mode() {
            FunctionalMode::IndirectWrite => {
                t.data = self.fifo.drain(..).collect();
                t.accepted = self.chip.execute(&t);
                self.activity = Activity::Writing(self.write_latency);
            }
            FunctionalMode::IndirectRead => {
                self.activity = Activity::Reading;
                if !self.stall_reads {
                    let len = self.data_len();
                    let data = self.chip.read(&t, len);
                    t.accepted = data.is_some();
                    t.data = data.unwrap_or_else(|| vec![0xFF; len]);

                    let delivered = len.saturating_sub(self.read_shortfall);
                    self.fifo.extend(t.data.iter().take(delivered).copied());
                    self.flags |= sr::TCF;
                }
            }
            FunctionalMode::StatusPolling => {
                self.activity = Activity::Polling(self.log.len());
            }
            FunctionalMode::MemoryMapped => (),
        }

        self.log.push(t);
    }

    fn pop_fifo(&mut self) -> u8 {
        let byte = self.fifo.pop_front().unwrap_or(0);
        if self.fifo.is_empty() && self.activity == Activity::Reading {
            self.activity = Activity::Idle;
        }
        byte
    }

    fn push_fifo(&mut self, bytes: &[u8]) {
        let writing = self.enabled()
            && !self.busy()
            && FunctionalMode::from_bits(self.reg(Reg::Ccr) >> ccr::FMODE_POS)
                == FunctionalMode::IndirectWrite;
        if !writing {
            return;
        }
        self.fifo.extend(bytes.iter().copied());
        self.try_start(Trigger::Dr);
    }
}

impl QspiRegs for SimQspi {
    fn read(&mut self, reg: Reg) -> u32 {
        match reg {
            Reg::Sr => {
                let val = self.sr();
                self.tick();
                val
            }
            Reg::Dr => {
                let mut bytes = [0; 4];
                for byte in &mut bytes {
                    *byte = self.pop_fifo();
                }
                u32::from_le_bytes(bytes)
            }
            _ => self.reg(reg),
        }
    }

    fn write(&mut self, reg: Reg, val: u32) {
        match reg {
            Reg::Cr => {
                if val & cr::ABORT != 0 {
                    if let Activity::Polling(i) = self.activity {
                        self.log[i].aborted = true;
                    }
                    self.activity = Activity::Idle;
                    self.fifo.clear();
                }
                // ABORT clears itself once done, which here is immediately.
                self.set(Reg::Cr, val & !cr::ABORT);
            }
            Reg::Sr => (),
            Reg::Fcr => self.flags &= !(val & (fcr::CTEF | fcr::CTCF | fcr::CSMF)),
            Reg::Ccr => {
                // RM: This register can be modified only when BUSY = 0.
                if !self.busy() {
                    self.set(Reg::Ccr, val);
                    self.try_start(Trigger::Ccr);
                }
            }
            Reg::Ar => {
                if !self.busy() {
                    self.set(Reg::Ar, val);
                    self.try_start(Trigger::Ar);
                }
            }
            Reg::Dr => self.push_fifo(&val.to_le_bytes()),
            _ => self.set(reg, val),
        }
    }

    fn read_u8(&mut self, reg: Reg) -> u8 {
        match reg {
            Reg::Dr => self.pop_fifo(),
            _ => self.read(reg) as u8,
        }
    }

    fn write_u8(&mut self, reg: Reg, val: u8) {
        match reg {
            Reg::Dr => self.push_fifo(&[val]),
            _ => self.write(reg, val as u32),
        }
    }

    fn read_mapped(&mut self, offset: u32, buf: &mut [u8]) {
        let cmd = Transaction::new(self.reg(Reg::Ccr), Some(offset));
        let mapped = self.enabled()
            && cmd.functional_mode() == FunctionalMode::MemoryMapped
            && self.chip.fast_read_ok(&cmd);

        if !mapped {
            // Nothing drives the bus.
            buf.fill(0);
            return;
        }

        let start = self.chip.offset(offset);
        let len = self.chip.memory.len();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.chip.memory[(start + i) % len];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qspi::Command;

    fn enabled() -> SimQspi {
        let mut sim = SimQspi::new(1 << 16);
        sim.write(Reg::Cr, cr::EN);
        sim
    }

    #[test]
    fn instruction_only_starts_on_ccr() {
        let mut sim = enabled();
        let cmd = Command::new(
            FunctionalMode::IndirectWrite,
            opcode::ENTER_QPI,
            ProtocolMode::Single,
        );
        sim.write(Reg::Ccr, cmd.ccr());

        assert_eq!(sim.log.len(), 1);
        assert!(sim.log[0].accepted);
        assert!(sim.chip.qpi);
        assert_ne!(sim.reg(Reg::Sr) & sr::BUSY, 0);

        // Busy for `write_latency` status reads.
        assert_ne!(sim.read(Reg::Sr) & sr::BUSY, 0);
        assert_ne!(sim.read(Reg::Sr) & sr::BUSY, 0);
        let sr_val = sim.read(Reg::Sr);
        assert_eq!(sr_val & sr::BUSY, 0);
        assert_ne!(sr_val & sr::TCF, 0);
    }

    #[test]
    fn write_with_data_starts_when_fifo_is_full() {
        let mut sim = enabled();
        sim.chip.qpi = true;
        sim.chip.four_byte = true;
        sim.chip.wel = true;

        sim.write(Reg::Dlr, 3);
        let cmd = Command::new(
            FunctionalMode::IndirectWrite,
            opcode::PAGE_PROGRAM_4B,
            ProtocolMode::Quad,
        )
        .address(0x10, AddressSize::A32, ProtocolMode::Quad)
        .data(ProtocolMode::Quad);
        sim.write(Reg::Ccr, cmd.ccr());
        sim.write(Reg::Ar, 0x10);
        assert!(sim.log.is_empty());

        sim.write_u8(Reg::Dr, 0x12);
        sim.write_u8(Reg::Dr, 0x34);
        sim.write_u8(Reg::Dr, 0x56);
        assert!(sim.log.is_empty());
        sim.write_u8(Reg::Dr, 0x78);

        assert_eq!(sim.log.len(), 1);
        assert!(sim.log[0].accepted);
        assert_eq!(sim.log[0].address, Some(0x10));
        assert_eq!(&sim.chip.memory[0x10..0x14], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(sim.chip.status() & status::WIP, status::WIP);
    }

    #[test]
    fn program_wraps_within_page() {
        let mut chip = SimChip::new(1 << 12);
        chip.qpi = true;
        chip.wel = true;

        let cmd = Command::new(
            FunctionalMode::IndirectWrite,
            opcode::PAGE_PROGRAM_4B,
            ProtocolMode::Quad,
        )
        .address(0xFE, AddressSize::A32, ProtocolMode::Quad)
        .data(ProtocolMode::Quad);
        let mut t = Transaction::new(cmd.ccr(), Some(0xFE));
        t.data = vec![0, 0, 0, 0];

        assert!(chip.execute(&t));
        assert_eq!(&chip.memory[0xFE..0x100], &[0, 0]);
        assert_eq!(&chip.memory[0..2], &[0, 0]);
        assert_eq!(chip.memory[0x100], 0xFF);
    }

    #[test]
    fn wrong_lines_are_ignored() {
        let mut sim = enabled();
        let cmd = Command::new(
            FunctionalMode::IndirectWrite,
            opcode::WRITE_ENABLE,
            ProtocolMode::Quad,
        );
        sim.write(Reg::Ccr, cmd.ccr());

        assert!(!sim.log[0].accepted);
        assert!(!sim.chip.wel);
    }

    #[test]
    fn abort_stops_polling() {
        let mut sim = enabled();
        sim.write(Reg::Psmkr, 0x01);
        sim.write(Reg::Psmar, 0x01);
        sim.write(Reg::Cr, cr::EN | cr::APMS);

        let cmd = Command::new(
            FunctionalMode::StatusPolling,
            opcode::READ_STATUS,
            ProtocolMode::Single,
        )
        .data(ProtocolMode::Single);
        sim.write(Reg::Ccr, cmd.ccr());

        for _ in 0..5 {
            assert_ne!(sim.read(Reg::Sr) & sr::BUSY, 0);
        }
        assert_eq!(sim.log[0].polls, 5);
        assert_eq!(sim.log[0].polled, Some(0));

        sim.write(Reg::Cr, cr::EN | cr::ABORT);
        assert_eq!(sim.read(Reg::Sr) & sr::BUSY, 0);
        assert_eq!(sim.reg(Reg::Cr) & cr::ABORT, 0);
        assert!(sim.log[0].aborted);
    }

    #[test]
    fn mapped_reads_need_fast_read_setup() {
        let mut sim = enabled();
        sim.chip.qpi = true;
        sim.chip.memory[..4].copy_from_slice(&[1, 2, 3, 4]);

        let cmd = Command::new(
            FunctionalMode::MemoryMapped,
            opcode::FAST_READ_QUAD_4B,
            ProtocolMode::Quad,
        )
        .address(0, AddressSize::A32, ProtocolMode::Quad)
        .data(ProtocolMode::Quad);

        // Too few dummy cycles for the chip.
        sim.write(Reg::Ccr, cmd.dummy_cycles(4).ccr());
        let mut buf = [0xAA; 4];
        sim.read_mapped(0, &mut buf);
        assert_eq!(buf, [0; 4]);

        sim.write(Reg::Ccr, cmd.dummy_cycles(READ_DUMMY_CYCLES).ccr());
        sim.read_mapped(0, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert!(sim.log.is_empty());
    }
}
