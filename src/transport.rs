// Copyright 2026 ecp5jtag contributors
// Licensed under the Apache-2.0 and MIT licenses.

//! This is the lowest-level module. It defines the `Transport` trait through which
//! every JTAG signal is driven, either one bit at a time or as whole byte blocks
//! shifted by a hardware peripheral, and the `Clock` used for idle deadlines
//! and settle delays.
//!
//! Concrete transports live in `gpio` (Linux GPIO character device) and `hal`
//! (any `embedded-hal` pins plus SPI bus).

use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport is not acquired.")]
    NotAcquired,
    #[error("Transport line I/O failed")]
    Line(#[source] anyhow::Error),
    #[error("Transport must be in {expected:?} mode for this operation.")]
    WrongMode { expected: Mode },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// JTAG output lines driven by the host.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Signal {
    Tck,
    Tms,
    Tdi,
}

/// Which side currently owns TCK, TDI and TDO.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Every line is toggled individually.
    Bit,
    /// TCK/TDI/TDO are driven by a block shifter, TMS is held low.
    Block,
}

/// Order in which the bits of each byte are placed on TDI.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BitOrder {
    /// Bit 0 first; captured TDO bits fill bit 0 first.
    LsbFirst,
    /// Bit 7 first; captured TDO bits fill bit 7 first.
    MsbFirst,
}

/// Trait for objects which drive the four JTAG lines.
///
/// Providers must implement `set_signal()` and `read_tdo()`. Everything else has a
/// software default built on those two, so a plain GPIO provider is a complete
/// transport. Providers with a hardware shifter (usually an SPI peripheral in mode 3
/// sharing the TCK/TDI/TDO pins) override the block methods.
///
/// Switching between bit and block mode produces exactly one TCK pulse with TMS low:
/// `enter_block_mode()` clocks the TDI level last driven in bit mode, and
/// `enter_bit_mode(tdi)` clocks `tdi`. Peripherals that glitch TCK while re-routing
/// pins produce this pulse as a side effect; glitch-free providers must issue it
/// themselves. Callers only switch inside Shift-DR where that bit is accounted for.
pub trait Transport {
    /// Take ownership of the lines: outputs driven, TDO an input.
    fn acquire(&mut self) -> Result<()> {
        Ok(())
    }

    /// Return all lines to inputs.
    fn release(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drive one output line.
    fn set_signal(&mut self, signal: Signal, level: bool) -> Result<()>;

    /// Sample TDO.
    fn read_tdo(&mut self) -> Result<bool>;

    /// Drive TCK low then high, producing one rising edge.
    fn pulse_clock(&mut self) -> Result<()> {
        self.set_signal(Signal::Tck, false)?;
        self.set_signal(Signal::Tck, true)
    }

    /// Set the TCK frequency used by block transfers.
    fn set_block_clock(&mut self, _hz: u32) -> Result<()> {
        Ok(())
    }

    /// Hand TCK/TDI/TDO to the block shifter.
    fn enter_block_mode(&mut self) -> Result<()> {
        self.pulse_clock()
    }

    /// Take TCK/TDI/TDO back for bit-level control.
    fn enter_bit_mode(&mut self, tdi: bool) -> Result<()> {
        self.set_signal(Signal::Tdi, tdi)?;
        self.pulse_clock()
    }

    /// Shift `data` out on TDI, MSB first, discarding TDO.
    fn write_block(&mut self, data: &[u8]) -> Result<()> {
        for byte in data {
            shift_bits(self, *byte, 8, BitOrder::MsbFirst, false)?;
        }
        Ok(())
    }

    /// Shift `len` bytes in from TDO, MSB first, with TDI low.
    fn read_block(&mut self, len: usize) -> Result<Vec<u8>> {
        (0..len).map(|_| shift_bits(self, 0x00, 8, BitOrder::MsbFirst, false)).collect()
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn acquire(&mut self) -> Result<()> {
        (**self).acquire()
    }

    fn release(&mut self) -> Result<()> {
        (**self).release()
    }

    fn set_signal(&mut self, signal: Signal, level: bool) -> Result<()> {
        (**self).set_signal(signal, level)
    }

    fn read_tdo(&mut self) -> Result<bool> {
        (**self).read_tdo()
    }

    fn pulse_clock(&mut self) -> Result<()> {
        (**self).pulse_clock()
    }

    fn set_block_clock(&mut self, hz: u32) -> Result<()> {
        (**self).set_block_clock(hz)
    }

    fn enter_block_mode(&mut self) -> Result<()> {
        (**self).enter_block_mode()
    }

    fn enter_bit_mode(&mut self, tdi: bool) -> Result<()> {
        (**self).enter_bit_mode(tdi)
    }

    fn write_block(&mut self, data: &[u8]) -> Result<()> {
        (**self).write_block(data)
    }

    fn read_block(&mut self, len: usize) -> Result<Vec<u8>> {
        (**self).read_block(len)
    }
}

/// Shift the first `nbits` bits of `value` in `order`, sampling TDO after each edge.
///
/// TMS is held low except on the final bit, where it is set to `exit`.
/// Returns the captured bits packed in the same order they were sent.
pub fn shift_bits<T: Transport + ?Sized>(
    transport: &mut T, value: u8, nbits: u8, order: BitOrder, exit: bool,
) -> Result<u8> {
    let mut captured = 0u8;
    for n in 0..nbits {
        let pos = match order {
            BitOrder::LsbFirst => n,
            BitOrder::MsbFirst => 7 - n,
        };
        transport.set_signal(Signal::Tdi, (value >> pos) & 1 == 1)?;
        transport.set_signal(Signal::Tms, exit && n == nbits - 1)?;
        transport.pulse_clock()?;
        captured |= (transport.read_tdo()? as u8) << pos;
    }
    Ok(captured)
}

/// Monotonic time source used for idle deadlines, Pause-DR settle time and poll pauses.
pub trait Clock {
    /// Time elapsed since an arbitrary fixed epoch.
    fn now(&mut self) -> Duration;

    /// Block for `duration`.
    fn sleep(&mut self, duration: Duration);
}

/// `Clock` backed by `std::time::Instant` and `std::thread::sleep`.
#[derive(Copy, Clone, Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock { epoch: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&mut self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
