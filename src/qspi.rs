//! Quad Serial Peripheral Interface (SPI) bus: A specialized interface used for
//! high-speed communications with external flash memory.
//!
//! The peripheral doesn't know about flash commands; it sends *phases* (instruction, address,
//! dummy cycles, data), configured in `CCR`. Each transaction here is described by an immutable
//! [`Command`], and `CCR` is always written as a whole from it. Fields in `CCR` are never
//! set with read-modify-write, so bits from a previous transaction can't leak into the next.
//!
//! Every wait on the hardware is bounded by `QspiConfig::timeout_iters`. On timeout the
//! transaction is aborted, and `QspiError::Timeout` is returned.

use crate::{
    error::Result,
    regs::{QspiRegs, Reg, ccr, cr, dcr, fcr, sr},
    traits::ClockCfg,
    util::bounded_loop,
};

/// Depth of the QUADSPI FIFO, in bytes. Indirect transfers are limited to this.
pub const FIFO_SIZE: usize = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// How many lines a phase uses. Affects the IMODE, ADMODE, ABMODE, and DMODE fields of the
/// CCR reg. Each of these fields affects a different phase of the transaction.
pub enum ProtocolMode {
    /// The phase is skipped.
    None = 0b00,
    /// Only a single IO line (IO0) is used for transmit and a separate line (IO1) is used for receive.
    Single = 0b01,
    /// Two IO lines (IO0 and IO1) are used for transmit/receive.
    Dual = 0b10,
    /// All four IO lines are used for transmit/receive.
    Quad = 0b11,
}

impl ProtocolMode {
    pub(crate) fn from_bits(bits: u32) -> Self {
        match bits & ccr::FIELD2_MASK {
            0b00 => Self::None,
            0b01 => Self::Single,
            0b10 => Self::Dual,
            _ => Self::Quad,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// Sets the Qspi Functional Mode. Affects the FMODE field of the CCR reg.
pub enum FunctionalMode {
    IndirectWrite = 0b00,
    IndirectRead = 0b01,
    /// Automatic status polling. The peripheral re-reads a status register until it matches.
    StatusPolling = 0b10,
    MemoryMapped = 0b11,
}

impl FunctionalMode {
    pub(crate) fn from_bits(bits: u32) -> Self {
        match bits & ccr::FIELD2_MASK {
            0b00 => Self::IndirectWrite,
            0b01 => Self::IndirectRead,
            0b10 => Self::StatusPolling,
            _ => Self::MemoryMapped,
        }
    }
}

/// Address sizes used by the QSPI interface
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressSize {
    /// 8 bit address size.
    A8 = 0b00,
    /// 16 bit address size.
    A16 = 0b01,
    /// 24 bit address size.
    A24 = 0b10,
    /// 32 bit address size.
    A32 = 0b11,
}

impl AddressSize {
    pub(crate) fn from_bits(bits: u32) -> Self {
        match bits & ccr::FIELD2_MASK {
            0b00 => Self::A8,
            0b01 => Self::A16,
            0b10 => Self::A24,
            _ => Self::A32,
        }
    }
}

/// Sampling mode for the QSPI interface
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SamplingEdge {
    Rising = 0,
    /// Sample half a CLK cycle later (SSHIFT). Gives the flash more time to drive the lines.
    Falling = 1,
}

/// The wait that didn't finish in time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Wait {
    /// `BUSY` didn't clear.
    Idle,
    /// `TCF` wasn't set.
    TransferComplete,
    /// The polled status register never matched.
    StatusMatch,
}

/// Indicates an error with the QSPI peripheral.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QspiError {
    /// A bounded wait ran out. A malformed command and an unresponsive chip look the same here.
    Timeout(Wait),
    /// The FIFO held fewer bytes than were requested.
    Underflow,
    /// An indirect transaction was requested after switching to memory-mapped mode.
    MemoryMapped,
    /// A memory-mapped read was requested before switching to memory-mapped mode.
    NotMemoryMapped,
    /// The read runs past the end of the memory.
    OutOfRange,
}

/// The peripheral's mode. The only transition is `Indirect` -> `MemoryMapped`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// Software issues each transaction explicitly.
    Indirect,
    /// Loads from the mapped window are translated into flash reads by hardware.
    MemoryMapped,
}

/// A structure for specifying QSPI configuration.
#[derive(Copy, Clone, Debug)]
pub struct QspiConfig {
    /// Highest serial clock the flash supports for the commands used, in Hz. The prescaler
    /// is picked so the QSPI clock doesn't exceed this.
    pub max_clock_hz: u32,
    pub sampling_edge: SamplingEdge,
    /// FIFO threshold, in bytes. 1 - 16.
    pub fifo_threshold: u8,
    /// Size of memory, in bytes. Must be a power of 2.
    pub mem_size: u32,
    /// Dummy cycles for the memory-mapped read command.
    pub dummy_cycles: u8,
    /// Cycles between two reads of the status register when auto-polling.
    pub poll_interval: u16,
    /// Upper bound of status register reads for every wait. Must cover the slowest
    /// operation used (sector erase, up to 400ms on MX25L51245G).
    pub timeout_iters: u32,
    /// Time to wait after enabling memory-mapped mode, before the first access, in ns.
    pub mapped_settle_ns: u32,
}

impl Default for QspiConfig {
    fn default() -> Self {
        Self {
            // MX25L51245G: Quad I/O fast read with 6 dummy cycles is rated up to 84Mhz.
            // At HCLK = 216Mhz, this gives 216 / 3 = 72Mhz.
            max_clock_hz: 84_000_000,
            sampling_edge: SamplingEdge::Falling,
            fifo_threshold: 1,
            // 512Mbit = 64MB.
            mem_size: 64 * 1_024 * 1_024,
            dummy_cycles: 6,
            poll_interval: 0x10,
            timeout_iters: 50_000_000,
            mapped_settle_ns: 1_000,
        }
    }
}

/// Describes one transaction: which phases are sent, on how many lines, and in which
/// functional mode. Build it fresh for each transaction; the `CCR` value comes from
/// [`Command::ccr`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Command {
    pub functional_mode: FunctionalMode,
    pub instruction: u8,
    pub instruction_mode: ProtocolMode,
    pub address: u32,
    pub address_mode: ProtocolMode,
    pub address_size: AddressSize,
    pub data_mode: ProtocolMode,
    pub dummy_cycles: u8,
}

impl Command {
    /// An instruction-only transaction.
    pub const fn new(
        functional_mode: FunctionalMode,
        instruction: u8,
        instruction_mode: ProtocolMode,
    ) -> Self {
        Self {
            functional_mode,
            instruction,
            instruction_mode,
            address: 0,
            address_mode: ProtocolMode::None,
            address_size: AddressSize::A24,
            data_mode: ProtocolMode::None,
            dummy_cycles: 0,
        }
    }

    /// Add an address phase.
    pub const fn address(mut self, address: u32, size: AddressSize, mode: ProtocolMode) -> Self {
        self.address = address;
        self.address_size = size;
        self.address_mode = mode;
        self
    }

    /// Add a data phase. The length comes from the buffer passed when the command is run.
    pub const fn data(mut self, mode: ProtocolMode) -> Self {
        self.data_mode = mode;
        self
    }

    pub const fn dummy_cycles(mut self, cycles: u8) -> Self {
        self.dummy_cycles = cycles;
        self
    }

    pub fn has_address(&self) -> bool {
        self.address_mode != ProtocolMode::None
    }

    pub fn has_data(&self) -> bool {
        self.data_mode != ProtocolMode::None
    }

    /// The complete `CCR` value for this transaction. ABMODE is 0 (no alternate bytes), and
    /// DDR is off.
    pub fn ccr(&self) -> u32 {
        ((self.functional_mode as u32) << ccr::FMODE_POS)
            | ((self.data_mode as u32) << ccr::DMODE_POS)
            | (((self.dummy_cycles as u32) << ccr::DCYC_POS) & ccr::DCYC_MASK)
            | ((self.address_size as u32) << ccr::ADSIZE_POS)
            | ((self.address_mode as u32) << ccr::ADMODE_POS)
            | ((self.instruction_mode as u32) << ccr::IMODE_POS)
            | self.instruction as u32
    }
}

/// A status-polling request: read a 1-byte register with `opcode` until
/// `(value & mask) == matches`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusPoll {
    pub opcode: u8,
    pub mask: u8,
    pub matches: u8,
    /// Lines used for the instruction and data phases.
    pub mode: ProtocolMode,
}

impl StatusPoll {
    /// Poll over all four lines.
    pub const fn new(opcode: u8, mask: u8, matches: u8) -> Self {
        Self {
            opcode,
            mask,
            matches,
            mode: ProtocolMode::Quad,
        }
    }

    fn command(&self) -> Command {
        Command::new(FunctionalMode::StatusPolling, self.opcode, self.mode).data(self.mode)
    }
}

/// Compute the `CR.PRESCALER` value that keeps the QSPI clock at or under `max_hz`.
///
/// RM: This field defines the scaler factor for generating CLK based on the
/// clock (value+1).
/// 0: FCLK = F, clock used directly as QUADSPI CLK (prescaler bypassed)
/// 1: FCLK = F/2
/// ...
/// 255: FCLK = F/256
pub fn prescaler(kernel_hz: u32, max_hz: u32) -> u8 {
    let div = kernel_hz.div_ceil(max_hz).max(1);
    (div - 1).min(255) as u8
}

/// Represents a Quad Serial Peripheral Interface (QSPI) peripheral.
pub struct Qspi<R> {
    pub regs: R,
    pub cfg: QspiConfig,
    mode: Mode,
}

impl<R: QspiRegs> Qspi<R> {
    /// Configure the peripheral, and leave it disabled. Clocks and pins must already be set up.
    pub fn new<C: ClockCfg>(mut regs: R, cfg: QspiConfig, clocks: &C) -> Result<Self> {
        assert!(
            cfg.dummy_cycles < 32,
            "Dummy cycles must be between 0 and 31."
        );
        assert!(
            cfg.mem_size >= 2 && cfg.mem_size.is_power_of_two(),
            "Memory size must be a power of 2."
        );
        assert!(
            (1..=16).contains(&cfg.fifo_threshold),
            "FIFO threshold must be between 1 and 16."
        );
        assert!(cfg.max_clock_hz > 0, "Max clock speed can't be 0.");

        // Disable QUADSPI before configuring it.
        regs.write(Reg::Cr, 0);

        // Many fields, including all CCR fields, can only be set when `BUSY` is clear.
        bounded_loop!(
            regs.read(Reg::Sr) & sr::BUSY != 0,
            QspiError::Timeout(Wait::Idle),
            cfg.timeout_iters
        );

        // RM: The FSIZE[4:0] field defines the size of external memory using the following formula:
        // Number of bytes in Flash memory = 2^[FSIZE+1]
        let fsize = cfg.mem_size.ilog2() - 1;
        regs.write(Reg::Dcr, (fsize << dcr::FSIZE_POS) & dcr::FSIZE_MASK);

        let prescaler = prescaler(clocks.hclk(), cfg.max_clock_hz);

        // When receiving data in SDR mode, the QUADSPI assumes that the Flash memories also
        // send the data using CLK's falling edge. By default (when SSHIFT = 0), the signals are
        // sampled using the following (rising) edge of CLK.
        let sshift = match cfg.sampling_edge {
            SamplingEdge::Rising => 0,
            SamplingEdge::Falling => cr::SSHIFT,
        };

        regs.write(
            Reg::Cr,
            ((prescaler as u32) << cr::PRESCALER_POS)
                | (((cfg.fifo_threshold as u32 - 1) << cr::FTHRES_POS) & cr::FTHRES_MASK)
                | sshift,
        );

        regs.write(Reg::Fcr, fcr::CTEF | fcr::CTCF | fcr::CSMF);

        #[cfg(feature = "defmt")]
        defmt::debug!("QSPI configured. Prescaler: {}, FSIZE: {}", prescaler, fsize);

        Ok(Self {
            regs,
            cfg,
            mode: Mode::Indirect,
        })
    }

    /// Check if the QSPI peripheral is currently busy with a transaction
    pub fn is_busy(&mut self) -> bool {
        self.regs.read(Reg::Sr) & sr::BUSY != 0
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Release the register block.
    pub fn free(self) -> R {
        self.regs
    }

    fn enable(&mut self) {
        let val = self.regs.read(Reg::Cr);
        self.regs.write(Reg::Cr, val | cr::EN);
    }

    fn disable(&mut self) {
        let val = self.regs.read(Reg::Cr);
        self.regs.write(Reg::Cr, val & !cr::EN);
    }

    /// Abort the current transaction, and leave the peripheral disabled, with flags and
    /// `DLR` cleared.
    fn abort(&mut self) {
        let val = self.regs.read(Reg::Cr);
        self.regs.write(Reg::Cr, val | cr::ABORT);

        // ABORT clears itself once the abort is done. Don't report a second error if it
        // doesn't; the original one is what the caller needs.
        let mut i = 0;
        while self.regs.read(Reg::Cr) & cr::ABORT != 0 && i < self.cfg.timeout_iters {
            i += 1;
        }

        self.disable();
        self.regs.write(Reg::Fcr, fcr::CTEF | fcr::CTCF | fcr::CSMF);
        self.regs.write(Reg::Dlr, 0);
    }

    /// Abort after a wait ran out. Returns the timeout error to report.
    fn timed_out(&mut self, wait: Wait) -> QspiError {
        #[cfg(feature = "defmt")]
        defmt::warn!("QSPI timed out waiting for {}; aborting", wait);

        self.abort();
        QspiError::Timeout(wait)
    }

    fn wait_idle(&mut self) -> Result<()> {
        let max = self.cfg.timeout_iters;
        bounded_loop!(self.is_busy(), self.timed_out(Wait::Idle), max);
        Ok(())
    }

    fn check_indirect(&self) -> Result<()> {
        if self.mode == Mode::MemoryMapped {
            return Err(QspiError::MemoryMapped.into());
        }
        Ok(())
    }

    /// Bring the peripheral to a clean, enabled state for a transaction of `len` data bytes.
    fn prepare(&mut self, len: usize) -> Result<()> {
        self.check_indirect()?;
        self.wait_idle()?;
        self.disable();

        // RM: Number of data to be retrieved (value+1) in indirect and status-polling modes.
        self.regs.write(Reg::Dlr, (len as u32).saturating_sub(1));
        self.regs.write(Reg::Fcr, fcr::CTEF | fcr::CTCF | fcr::CSMF);

        self.enable();
        Ok(())
    }

    /// Write the command's phases. Depending on its phases, the transfer starts on the `CCR`
    /// write (no address, no write data), or on the `AR` write (no write data). Otherwise it
    /// starts once the data is in the FIFO.
    fn issue(&mut self, cmd: &Command) {
        #[cfg(feature = "defmt")]
        defmt::debug!("QSPI instruction {=u8:#x}", cmd.instruction);

        self.regs.write(Reg::Ccr, cmd.ccr());
        if cmd.has_address() {
            self.regs.write(Reg::Ar, cmd.address);
        }
    }

    /// Wait for the transaction to end, and return to the disabled baseline.
    fn complete(&mut self) -> Result<()> {
        self.wait_idle()?;
        self.regs.write(Reg::Fcr, fcr::CTCF);
        self.disable();
        self.regs.write(Reg::Dlr, 0);
        Ok(())
    }

    /// Send an instruction, with an optional address, and no data.
    pub fn command(&mut self, cmd: &Command) -> Result<()> {
        self.write_indirect(cmd, &[])
    }

    /// Perform a write in indirect mode. `data` must fit in the FIFO.
    pub fn write_indirect(&mut self, cmd: &Command, data: &[u8]) -> Result<()> {
        assert!(
            data.len() <= FIFO_SIZE,
            "Transactions larger than the QSPI FIFO are currently unsupported"
        );
        assert!(cmd.functional_mode == FunctionalMode::IndirectWrite);
        assert!(
            data.is_empty() != cmd.has_data(),
            "Data must be passed if, and only if the command has a data phase."
        );

        self.prepare(data.len())?;

        // Instruction and address must be set before the data, since writing the data
        // may start the transfer.
        self.issue(cmd);

        let mut words = data.chunks_exact(4);
        for word in &mut words {
            self.regs.write(
                Reg::Dr,
                u32::from_le_bytes([word[0], word[1], word[2], word[3]]),
            );
        }
        for byte in words.remainder() {
            self.regs.write_u8(Reg::Dr, *byte);
        }

        self.complete()
    }

    /// Perform a read in indirect mode. `buf` must fit in the FIFO.
    pub fn read_indirect(&mut self, cmd: &Command, buf: &mut [u8]) -> Result<()> {
        assert!(
            !buf.is_empty() && buf.len() <= FIFO_SIZE,
            "Reads must be between 1 byte and the FIFO size"
        );
        assert!(cmd.functional_mode == FunctionalMode::IndirectRead && cmd.has_data());

        self.prepare(buf.len())?;
        self.issue(cmd);

        let max = self.cfg.timeout_iters;
        bounded_loop!(
            self.regs.read(Reg::Sr) & sr::TCF == 0,
            self.timed_out(Wait::TransferComplete),
            max
        );

        // Check for underflow on the FIFO.
        let level = (self.regs.read(Reg::Sr) & sr::FLEVEL_MASK) >> sr::FLEVEL_POS;
        if (level as usize) < buf.len() {
            #[cfg(feature = "defmt")]
            defmt::warn!("QSPI FIFO underflow: {} of {} bytes", level, buf.len());

            self.abort();
            return Err(QspiError::Underflow.into());
        }

        for byte in buf.iter_mut() {
            *byte = self.regs.read_u8(Reg::Dr);
        }

        self.complete()
    }

    /// Have the peripheral poll a status register until `(value & mask) == matches`, and
    /// block until it does.
    pub fn poll_status(&mut self, poll: &StatusPoll) -> Result<()> {
        self.check_indirect()?;
        self.wait_idle()?;
        self.disable();

        self.regs.write(Reg::Psmkr, poll.mask as u32);
        self.regs.write(Reg::Psmar, poll.matches as u32);
        self.regs.write(Reg::Pir, self.cfg.poll_interval as u32);
        // One status byte per read.
        self.regs.write(Reg::Dlr, 0);

        // AND match mode; stop automatically on the first match.
        let val = self.regs.read(Reg::Cr);
        self.regs.write(Reg::Cr, (val | cr::APMS) & !cr::PMM);
        self.regs.write(Reg::Fcr, fcr::CSMF | fcr::CTCF);

        self.enable();
        // Writing the instruction starts polling.
        self.issue(&poll.command());

        let max = self.cfg.timeout_iters;
        bounded_loop!(self.is_busy(), self.timed_out(Wait::StatusMatch), max);

        // Acknowledge the status match.
        self.regs.write(Reg::Fcr, fcr::CSMF);
        self.disable();
        Ok(())
    }

    /// Switch to memory-mapped mode, using `cmd` for reads. There's no way back to
    /// indirect mode.
    pub fn memory_mapped(&mut self, cmd: &Command) -> Result<()> {
        assert!(cmd.functional_mode == FunctionalMode::MemoryMapped);

        self.check_indirect()?;
        self.wait_idle()?;
        self.disable();

        self.regs.write(Reg::Dlr, 0);
        self.regs.write(Reg::Ccr, cmd.ccr());
        self.enable();
        self.regs.barrier();

        self.mode = Mode::MemoryMapped;

        #[cfg(feature = "defmt")]
        defmt::info!("QSPI memory-mapped with instruction {=u8:#x}", cmd.instruction);

        Ok(())
    }

    /// Load `buf.len()` bytes from the memory-mapped window, starting at `offset`.
    pub fn read_mapped(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        if self.mode != Mode::MemoryMapped {
            return Err(QspiError::NotMemoryMapped.into());
        }
        if offset as u64 + buf.len() as u64 > self.cfg.mem_size as u64 {
            return Err(QspiError::OutOfRange.into());
        }

        self.regs.read_mapped(offset, buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::Error, sim::SimQspi, traits::FixedClock};

    const SIZE: u32 = 1 << 16;

    fn qspi() -> Qspi<SimQspi> {
        let cfg = QspiConfig {
            mem_size: SIZE,
            timeout_iters: 1_000,
            ..Default::default()
        };
        Qspi::new(SimQspi::new(SIZE as usize), cfg, &FixedClock::new(216_000_000)).unwrap()
    }

    #[test]
    fn prescaler_keeps_clock_under_max() {
        assert_eq!(prescaler(216_000_000, 84_000_000), 2);
        assert_eq!(prescaler(168_000_000, 84_000_000), 1);
        assert_eq!(prescaler(48_000_000, 84_000_000), 0);
        assert_eq!(prescaler(1_000_000_000, 1_000_000), 255);
    }

    #[test]
    fn init_sets_size_and_clock_and_stays_disabled() {
        let cfg = QspiConfig::default();
        let qspi = Qspi::new(
            SimQspi::new(1 << 12),
            cfg,
            &FixedClock::new(216_000_000),
        )
        .unwrap();

        // 64MB = 2^(25 + 1) bytes.
        assert_eq!(qspi.regs.reg(Reg::Dcr), 25 << dcr::FSIZE_POS);
        let cr_val = qspi.regs.reg(Reg::Cr);
        assert_eq!(cr_val >> cr::PRESCALER_POS, 2);
        assert_ne!(cr_val & cr::SSHIFT, 0);
        assert_eq!(cr_val & cr::EN, 0);
        assert_eq!(qspi.mode(), Mode::Indirect);
    }

    #[test]
    fn ccr_encoding() {
        let read = Command::new(FunctionalMode::MemoryMapped, 0xEC, ProtocolMode::Quad)
            .address(0, AddressSize::A32, ProtocolMode::Quad)
            .data(ProtocolMode::Quad)
            .dummy_cycles(6);
        assert_eq!(read.ccr(), 0x0F18_3FEC);

        let erase = Command::new(FunctionalMode::IndirectWrite, 0x20, ProtocolMode::Quad).address(
            0x1000,
            AddressSize::A24,
            ProtocolMode::Quad,
        );
        assert_eq!(erase.ccr(), 0x0000_2F20);
        assert!(erase.has_address());
        assert!(!erase.has_data());

        let enter_qpi = Command::new(FunctionalMode::IndirectWrite, 0x35, ProtocolMode::Single);
        assert_eq!(enter_qpi.ccr(), 0x0000_2135);
    }

    #[test]
    fn ccr_is_rewritten_whole() {
        let mut qspi = qspi();
        let single = Command::new(FunctionalMode::IndirectWrite, 0x35, ProtocolMode::Single);
        qspi.command(&single).unwrap();

        let quad = Command::new(FunctionalMode::IndirectWrite, 0xB7, ProtocolMode::Quad);
        qspi.command(&quad).unwrap();

        assert_eq!(qspi.regs.reg(Reg::Ccr), quad.ccr());
        assert_eq!(qspi.regs.reg(Reg::Cr) & cr::EN, 0);
        assert_eq!(qspi.regs.reg(Reg::Dlr), 0);
    }

    #[test]
    fn poll_times_out_when_chip_never_matches() {
        let mut qspi = qspi();
        // The chip is still in SPI mode, so it ignores a quad-line status read.
        let result = qspi.poll_status(&StatusPoll::new(0x05, 0x41, 0x40));

        assert_eq!(
            result,
            Err(Error::QspiError(QspiError::Timeout(Wait::StatusMatch)))
        );
        assert!(!qspi.is_busy());
        assert_eq!(qspi.regs.reg(Reg::Cr) & cr::EN, 0);
    }

    #[test]
    fn command_times_out_when_never_idle() {
        let mut qspi = qspi();
        qspi.regs.write_latency = 1_000_000;

        let enter_qpi = Command::new(FunctionalMode::IndirectWrite, 0x35, ProtocolMode::Single);
        assert_eq!(
            qspi.command(&enter_qpi),
            Err(Error::QspiError(QspiError::Timeout(Wait::Idle)))
        );
        assert!(!qspi.is_busy());
        assert_eq!(qspi.regs.reg(Reg::Cr) & cr::EN, 0);
        assert_eq!(qspi.regs.reg(Reg::Dlr), 0);

        // The peripheral is usable again after the abort.
        qspi.regs.write_latency = 2;
        let wren = Command::new(FunctionalMode::IndirectWrite, 0x06, ProtocolMode::Quad);
        qspi.command(&wren).unwrap();
        assert!(qspi.regs.log.last().unwrap().accepted);
        assert!(qspi.regs.chip.wel);
    }

    #[test]
    fn read_times_out_without_transfer_complete() {
        let mut qspi = qspi();
        qspi.regs.stall_reads = true;

        let read_sr = Command::new(FunctionalMode::IndirectRead, 0x05, ProtocolMode::Single)
            .data(ProtocolMode::Single);
        let mut buf = [0; 1];
        assert_eq!(
            qspi.read_indirect(&read_sr, &mut buf),
            Err(Error::QspiError(QspiError::Timeout(Wait::TransferComplete)))
        );
        assert!(!qspi.is_busy());
        assert_eq!(qspi.regs.reg(Reg::Cr) & cr::EN, 0);
    }

    #[test]
    fn short_read_underflows() {
        let mut qspi = qspi();
        qspi.regs.read_shortfall = 1;

        let read_sr = Command::new(FunctionalMode::IndirectRead, 0x05, ProtocolMode::Single)
            .data(ProtocolMode::Single);
        let mut buf = [0xAA; 4];
        assert_eq!(
            qspi.read_indirect(&read_sr, &mut buf),
            Err(Error::QspiError(QspiError::Underflow))
        );
        assert!(!qspi.is_busy());
        assert_eq!(qspi.regs.reg(Reg::Cr) & cr::EN, 0);
        assert_eq!(qspi.regs.reg(Reg::Dlr), 0);

        qspi.regs.read_shortfall = 0;
        qspi.read_indirect(&read_sr, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn mapped_reads_need_memory_mapped_mode() {
        let mut qspi = qspi();
        let mut buf = [0; 4];
        assert_eq!(
            qspi.read_mapped(0, &mut buf),
            Err(Error::QspiError(QspiError::NotMemoryMapped))
        );
    }

    #[test]
    fn no_indirect_commands_once_mapped() {
        let mut qspi = qspi();
        let read = Command::new(FunctionalMode::MemoryMapped, 0xEC, ProtocolMode::Quad)
            .address(0, AddressSize::A32, ProtocolMode::Quad)
            .data(ProtocolMode::Quad)
            .dummy_cycles(6);
        qspi.memory_mapped(&read).unwrap();
        assert_eq!(qspi.mode(), Mode::MemoryMapped);

        let wren = Command::new(FunctionalMode::IndirectWrite, 0x06, ProtocolMode::Quad);
        assert_eq!(
            qspi.command(&wren),
            Err(Error::QspiError(QspiError::MemoryMapped))
        );
        assert_eq!(
            qspi.poll_status(&StatusPoll::new(0x05, 0x01, 0x00)),
            Err(Error::QspiError(QspiError::MemoryMapped))
        );
        assert_eq!(
            qspi.memory_mapped(&read),
            Err(Error::QspiError(QspiError::MemoryMapped))
        );

        let mut buf = [0; 8];
        assert_eq!(
            qspi.read_mapped(SIZE - 4, &mut buf),
            Err(Error::QspiError(QspiError::OutOfRange))
        );
    }
}
