// Copyright 2026 ecp5jtag contributors
// Licensed under the Apache-2.0 and MIT licenses.

//! Transport built from `embedded-hal` pins and an SPI bus.
//!
//! TCK, TDI and TDO are shared between GPIO pins and an SPI peripheral in
//! mode 3 (clock idles high, data sampled on the rising edge). A `PinMux`
//! moves those three pins between the two. TMS is always a GPIO and is held
//! low while the SPI peripheral owns the other lines.

use embedded_hal::digital::{InputPin, OutputPin, PinState};
use embedded_hal::spi::SpiBus;
use crate::transport::{Error, Mode, Result, Signal, Transport};

/// Routes TCK/TDI/TDO between GPIO control and the SPI peripheral.
pub trait PinMux {
    /// Hand TCK/TDI/TDO to the SPI peripheral.
    fn route_to_spi(&mut self) -> anyhow::Result<()>;

    /// Return TCK/TDI/TDO to GPIO control.
    fn route_to_gpio(&mut self) -> anyhow::Result<()>;

    /// Set the SPI clock frequency.
    fn set_frequency(&mut self, _hz: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Tri-state every line once the transport is released.
    fn release(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// JTAG transport over `embedded-hal` pins with SPI-accelerated block transfers.
pub struct HalTransport<TCK, TMS, TDI, TDO, SPI, MUX> {
    tck: TCK,
    tms: TMS,
    tdi: TDI,
    tdo: TDO,
    spi: SPI,
    mux: MUX,
    mode: Mode,
    glitch_free: bool,
}

impl<TCK, TMS, TDI, TDO, SPI, MUX> HalTransport<TCK, TMS, TDI, TDO, SPI, MUX>
    where TCK: OutputPin, TMS: OutputPin, TDI: OutputPin, TDO: InputPin,
          SPI: SpiBus<u8>, MUX: PinMux
{
    pub fn new(tck: TCK, tms: TMS, tdi: TDI, tdo: TDO, spi: SPI, mux: MUX) -> Self {
        HalTransport { tck, tms, tdi, tdo, spi, mux, mode: Mode::Bit, glitch_free: true }
    }

    /// Set whether re-routing the pins leaves TCK untouched.
    ///
    /// Muxes which glitch TCK while switching already produce the one switch
    /// clock; for glitch-free muxes (the default) the transport pulses TCK itself.
    pub fn with_glitch_free(mut self, glitch_free: bool) -> Self {
        self.glitch_free = glitch_free;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn release_parts(self) -> (TCK, TMS, TDI, TDO, SPI, MUX) {
        (self.tck, self.tms, self.tdi, self.tdo, self.spi, self.mux)
    }

    fn require_mode(&self, expected: Mode) -> Result<()> {
        if self.mode == expected {
            Ok(())
        } else {
            Err(Error::WrongMode { expected })
        }
    }
}

impl<TCK, TMS, TDI, TDO, SPI, MUX> Transport for HalTransport<TCK, TMS, TDI, TDO, SPI, MUX>
    where TCK: OutputPin, TMS: OutputPin, TDI: OutputPin, TDO: InputPin,
          SPI: SpiBus<u8>, MUX: PinMux
{
    fn acquire(&mut self) -> Result<()> {
        if self.mode == Mode::Block {
            self.mux.route_to_gpio().map_err(Error::Line)?;
            self.mode = Mode::Bit;
        }
        self.tck.set_high().map_err(pin_error)?;
        self.tms.set_high().map_err(pin_error)?;
        self.tdi.set_low().map_err(pin_error)?;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if self.mode == Mode::Block {
            self.mux.route_to_gpio().map_err(Error::Line)?;
            self.mode = Mode::Bit;
        }
        self.mux.release().map_err(Error::Line)
    }

    fn set_signal(&mut self, signal: Signal, level: bool) -> Result<()> {
        self.require_mode(Mode::Bit)?;
        let state = PinState::from(level);
        match signal {
            Signal::Tck => self.tck.set_state(state).map_err(pin_error),
            Signal::Tms => self.tms.set_state(state).map_err(pin_error),
            Signal::Tdi => self.tdi.set_state(state).map_err(pin_error),
        }
    }

    fn read_tdo(&mut self) -> Result<bool> {
        self.require_mode(Mode::Bit)?;
        self.tdo.is_high().map_err(pin_error)
    }

    fn set_block_clock(&mut self, hz: u32) -> Result<()> {
        log::debug!("SPI clock set to {} Hz", hz);
        self.mux.set_frequency(hz).map_err(Error::Line)
    }

    fn enter_block_mode(&mut self) -> Result<()> {
        self.require_mode(Mode::Bit)?;
        self.tms.set_low().map_err(pin_error)?;
        if self.glitch_free {
            self.pulse_clock()?;
        }
        self.mux.route_to_spi().map_err(Error::Line)?;
        self.mode = Mode::Block;
        Ok(())
    }

    fn enter_bit_mode(&mut self, tdi: bool) -> Result<()> {
        self.require_mode(Mode::Block)?;
        self.tdi.set_state(PinState::from(tdi)).map_err(pin_error)?;
        self.mux.route_to_gpio().map_err(Error::Line)?;
        self.mode = Mode::Bit;
        if self.glitch_free {
            self.pulse_clock()?;
        }
        Ok(())
    }

    fn write_block(&mut self, data: &[u8]) -> Result<()> {
        self.require_mode(Mode::Block)?;
        self.spi.write(data).map_err(spi_error)?;
        self.spi.flush().map_err(spi_error)
    }

    fn read_block(&mut self, len: usize) -> Result<Vec<u8>> {
        self.require_mode(Mode::Block)?;
        let zeros = vec![0u8; len];
        let mut data = vec![0u8; len];
        self.spi.transfer(&mut data, &zeros).map_err(spi_error)?;
        self.spi.flush().map_err(spi_error)?;
        Ok(data)
    }
}

fn pin_error<E: core::fmt::Debug>(e: E) -> Error {
    Error::Line(anyhow::anyhow!("GPIO error: {:?}", e))
}

fn spi_error<E: core::fmt::Debug>(e: E) -> Error {
    Error::Line(anyhow::anyhow!("SPI error: {:?}", e))
}
