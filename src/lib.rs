//! This library brings up an external NOR flash over the QUADSPI peripheral on STM32
//! microcontrollers, and switches it to memory-mapped mode, so it can be read (and code
//! executed from it) like internal memory.
//!
//! It's built for the Macronix MX25L51245G on the STM32F7 discovery boards, but the
//! peripheral layer in [`qspi`] works with any flash chip. Register access goes through
//! the [`regs::QspiRegs`] trait; select an MCU feature (eg `f723`) to use the real
//! `QUADSPI` block, or the `sim` feature for a simulated peripheral and chip.
//!
//! Typical use:
//! ```ignore
//! let qspi = Qspi::new(dp.QUADSPI, QspiConfig::default(), &FixedClock::new(216_000_000))?;
//! let mut flash = QspiFlash::new(qspi);
//!
//! flash.enter_quad_mode()?;
//! flash.enable_4byte_addressing()?;
//! flash.erase_sector(0)?;
//! flash.write_word(0, 0x0123_4567)?;
//! flash.enter_memory_mapped(&mut delay)?;
//!
//! let val = flash.read_mapped_u32(0)?;
//! ```

#![cfg_attr(not(any(test, feature = "sim")), no_std)]

use cfg_if::cfg_if;

// F7 PAC
#[cfg(feature = "f722")]
pub use stm32f7::stm32f722 as pac;

#[cfg(feature = "f723")]
pub use stm32f7::stm32f723 as pac;

#[cfg(feature = "f732")]
pub use stm32f7::stm32f732 as pac;

#[cfg(feature = "f733")]
pub use stm32f7::stm32f733 as pac;

#[cfg(feature = "f746")]
pub use stm32f7::stm32f746 as pac;

#[cfg(feature = "f756")]
pub use stm32f7::stm32f756 as pac;

#[cfg(feature = "f767")]
pub use stm32f7::stm32f767 as pac;

#[cfg(feature = "f769")]
pub use stm32f7::stm32f769 as pac;

#[cfg(feature = "f777")]
pub use stm32f7::stm32f777 as pac;

#[cfg(feature = "f779")]
pub use stm32f7::stm32f779 as pac;

// H7 PAC
#[cfg(feature = "h743")]
pub use stm32h7::stm32h743 as pac;

#[cfg(feature = "h743v")]
pub use stm32h7::stm32h743v as pac;

#[cfg(feature = "h747cm7")]
pub use stm32h7::stm32h747cm7 as pac;

#[cfg(feature = "h753")]
pub use stm32h7::stm32h753 as pac;

#[cfg(feature = "h753v")]
pub use stm32h7::stm32h753v as pac;

cfg_if! {
    if #[cfg(all(feature = "f7", feature = "h7"))] {
        compile_error!("Select MCU features from a single family.");
    }
}

pub mod error;
pub mod flash;
pub mod qspi;
pub mod regs;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod traits;

// Not public to the user; used for bounded waits in the drivers.
mod util;

pub use error::{Error, Result};
pub use flash::{FlashError, QspiFlash};
pub use qspi::{Command, Qspi, QspiConfig, QspiError};
pub use traits::{ClockCfg, FixedClock};
