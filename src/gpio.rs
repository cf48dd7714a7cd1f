// Copyright 2026 ecp5jtag contributors
// Licensed under the Apache-2.0 and MIT licenses.

//! Bit-level transport over the Linux GPIO character device.
//!
//! Block transfers use the software defaults from `Transport`, so this transport
//! is slow but needs nothing beyond four GPIO lines.

use gpiocdev::line::{Offset, Value};
use gpiocdev::request::{Config, Request};
use crate::transport::{Error, Result, Signal, Transport};

/// GPIO chip and line offsets for the JTAG lines.
#[derive(Clone, Debug)]
pub struct LinuxGpioConfig {
    /// Device path, e.g. "/dev/gpiochip0".
    pub chip: String,
    pub tck: Offset,
    pub tms: Offset,
    pub tdi: Offset,
    pub tdo: Offset,
    /// Activity LED, lit while the lines are acquired.
    pub led: Option<Offset>,
}

impl Default for LinuxGpioConfig {
    fn default() -> Self {
        LinuxGpioConfig {
            chip: "/dev/gpiochip0".to_string(),
            tck: 18,
            tms: 21,
            tdi: 23,
            tdo: 19,
            led: None,
        }
    }
}

/// JTAG transport driving GPIO lines through `gpiocdev`.
///
/// Lines are only requested from the kernel between `acquire()` and `release()`.
pub struct LinuxGpio {
    config: LinuxGpioConfig,
    request: Option<Request>,
}

impl LinuxGpio {
    pub fn new(config: LinuxGpioConfig) -> Self {
        LinuxGpio { config, request: None }
    }

    pub fn config(&self) -> &LinuxGpioConfig {
        &self.config
    }

    fn request(&self) -> Result<&Request> {
        self.request.as_ref().ok_or(Error::NotAcquired)
    }

    fn line(&self, signal: Signal) -> Offset {
        match signal {
            Signal::Tck => self.config.tck,
            Signal::Tms => self.config.tms,
            Signal::Tdi => self.config.tdi,
        }
    }

    fn offsets(&self) -> Vec<Offset> {
        let c = &self.config;
        let mut offsets = vec![c.tck, c.tms, c.tdi, c.tdo];
        offsets.extend(c.led);
        offsets
    }
}

impl Transport for LinuxGpio {
    fn acquire(&mut self) -> Result<()> {
        if self.request.is_some() {
            return Ok(());
        }
        let c = &self.config;
        let mut cfg = Config::default();
        cfg.with_line(c.tck).as_output(Value::Active);
        cfg.with_line(c.tms).as_output(Value::Active);
        cfg.with_line(c.tdi).as_output(Value::Inactive);
        cfg.with_line(c.tdo).as_input();
        if let Some(led) = c.led {
            cfg.with_line(led).as_output(Value::Active);
        }
        let request = Request::from_config(cfg)
            .on_chip(&c.chip)
            .with_consumer("ecp5jtag")
            .request()
            .map_err(line_error)?;
        log::debug!("Acquired {} (tck={}, tms={}, tdi={}, tdo={})",
                    c.chip, c.tck, c.tms, c.tdi, c.tdo);
        self.request = Some(request);
        Ok(())
    }

    /// Turn the LED off and return every line to an input before giving it back.
    ///
    /// The lines are given back even if a step fails; the first error is returned.
    fn release(&mut self) -> Result<()> {
        let request = match self.request.take() {
            Some(request) => request,
            None => return Ok(()),
        };
        let led = match self.config.led {
            Some(led) => request.set_value(led, Value::Inactive).map(|_| ()).map_err(line_error),
            None => Ok(()),
        };
        let inputs = request.reconfigure(&input_config(&self.offsets())).map_err(line_error);
        log::debug!("Released {}", self.config.chip);
        led.and(inputs)
    }

    fn set_signal(&mut self, signal: Signal, level: bool) -> Result<()> {
        let line = self.line(signal);
        let value = if level { Value::Active } else { Value::Inactive };
        self.request()?.set_value(line, value).map_err(line_error)?;
        Ok(())
    }

    fn read_tdo(&mut self) -> Result<bool> {
        let value = self.request()?.value(self.config.tdo).map_err(line_error)?;
        Ok(matches!(value, Value::Active))
    }
}

impl Drop for LinuxGpio {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Error releasing GPIO lines: {}", e);
        }
    }
}

/// Request config with every line in `offsets` as an input.
fn input_config(offsets: &[Offset]) -> Config {
    let mut cfg = Config::default();
    for &offset in offsets {
        cfg.with_line(offset).as_input();
    }
    cfg
}

fn line_error(e: gpiocdev::Error) -> Error {
    Error::Line(e.into())
}
