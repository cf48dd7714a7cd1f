// Copyright 2026 ecp5jtag contributors
// Licensed under the Apache-2.0 and MIT licenses.

//! ecp5jtag
//!
//! ECP5 FPGA SRAM and SPI flash programming by driving the JTAG TAP directly,
//! bit by bit over GPIO or with an SPI peripheral standing in for block transfers.

pub mod transport;
pub mod jtag;
pub mod flash;
pub mod ecp5;
pub mod hal;

#[cfg(feature = "gpio")]
pub mod gpio;

#[cfg(test)]
mod sim;

pub use transport::{Clock, Mode, SystemClock, Transport};
pub use jtag::{Tap, TapState};
pub use flash::{Flash, FlashAccess, FlashGeometry, ProgramStats};
pub use ecp5::{ECP5, ECP5IDCODE, Ecp5Config, ConfigSession, FlashSession, Status};
