// Traits used across the library. Could be used more generally than in this lib.

/// This trait allows you to return information about a clock configuration's speeds.
/// It's used for configuring peripherals. The QUADSPI kernel clock is HCLK on the
/// supported families.
pub trait ClockCfg {
    /// HCLK speed, in Hz. Ie AHB bus, core, memory, and DMA.
    fn hclk(&self) -> u32;
}

/// A clock tree that's already been set up elsewhere, and whose speed doesn't change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FixedClock {
    /// HCLK, in Hz.
    pub hclk: u32,
}

impl FixedClock {
    pub const fn new(hclk: u32) -> Self {
        Self { hclk }
    }
}

impl ClockCfg for FixedClock {
    fn hclk(&self) -> u32 {
        self.hclk
    }
}
