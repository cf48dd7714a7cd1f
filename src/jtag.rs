// Copyright 2026 ecp5jtag contributors
// Licensed under the Apache-2.0 and MIT licenses.

//! TAP sequencing on top of a `Transport`.
//!
//! `Tap` tracks the TAP controller state explicitly and checks it on entry to
//! every operation. All scans start and finish in Select-DR-Scan, so they can be
//! chained without extra TMS bookkeeping.

use std::time::Duration;
use thiserror::Error;
use crate::transport::{self, BitOrder, Clock, Mode, Signal, SystemClock, Transport};

#[derive(Error, Debug)]
pub enum Error {
    #[error("TAP is in state {actual:?}, operation requires {expected:?}")]
    TapState { expected: TapState, actual: Option<TapState> },
    #[error("Cannot shift an empty register")]
    EmptyShift,
    #[error("Transport is in {actual:?} mode, operation requires {expected:?} mode")]
    WrongMode { expected: Mode, actual: Mode },
    #[error("Transport error")]
    Transport(#[from] transport::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// States of the IEEE 1149.1 TAP controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TapState {
    TestLogicReset,
    RunTestIdle,
    SelectDrScan,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIrScan,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
}

impl TapState {
    /// State reached on the next TCK rising edge with the given TMS level.
    pub fn next(self, tms: bool) -> TapState {
        use TapState::*;
        match (self, tms) {
            (TestLogicReset, true) => TestLogicReset,
            (TestLogicReset, false) => RunTestIdle,
            (RunTestIdle, true) => SelectDrScan,
            (RunTestIdle, false) => RunTestIdle,
            (SelectDrScan, true) => SelectIrScan,
            (SelectDrScan, false) => CaptureDr,
            (CaptureDr, true) => Exit1Dr,
            (CaptureDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (Exit1Dr, true) => UpdateDr,
            (Exit1Dr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (PauseDr, false) => PauseDr,
            (Exit2Dr, true) => UpdateDr,
            (Exit2Dr, false) => ShiftDr,
            (UpdateDr, true) => SelectDrScan,
            (UpdateDr, false) => RunTestIdle,
            (SelectIrScan, true) => TestLogicReset,
            (SelectIrScan, false) => CaptureIr,
            (CaptureIr, true) => Exit1Ir,
            (CaptureIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (Exit1Ir, true) => UpdateIr,
            (Exit1Ir, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (PauseIr, false) => PauseIr,
            (Exit2Ir, true) => UpdateIr,
            (Exit2Ir, false) => ShiftIr,
            (UpdateIr, true) => SelectDrScan,
            (UpdateIr, false) => RunTestIdle,
        }
    }
}

/// Run-Test/Idle dwell requested after an Update-xR.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Idle {
    /// Minimum number of TCK cycles.
    pub count: u32,
    /// Minimum wall-clock time.
    pub duration: Duration,
}

impl Idle {
    pub const fn new(count: u32, duration: Duration) -> Self {
        Idle { count, duration }
    }

    pub const fn cycles(count: u32) -> Self {
        Idle { count, duration: Duration::ZERO }
    }
}

/// Parameters for one full DR scan.
///
/// If `expected` is set, the captured bytes are compared against it over
/// `expected.len()` bytes, after masking with `mask` if that is also set.
/// A mismatch is logged and counted but does not fail the scan.
#[derive(Copy, Clone, Debug)]
pub struct DrScan<'a> {
    pub data: &'a [u8],
    pub mask: Option<&'a [u8]>,
    pub expected: Option<&'a [u8]>,
    pub label: &'a str,
    pub pause: Duration,
    pub idle: Option<Idle>,
}

impl<'a> DrScan<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        DrScan { data, mask: None, expected: None, label: "", pause: Duration::ZERO, idle: None }
    }

    pub fn mask(mut self, mask: &'a [u8]) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn expect(mut self, expected: &'a [u8]) -> Self {
        self.expected = Some(expected);
        self
    }

    pub fn label(mut self, label: &'a str) -> Self {
        self.label = label;
        self
    }

    /// Time to hold the TAP in Pause-DR before updating.
    pub fn pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn idle(mut self, idle: Idle) -> Self {
        self.idle = Some(idle);
        self
    }
}

/// Returns true if any `(response[i] & mask[i]) != expected[i]`.
///
/// Only the first `expected.len()` bytes are compared. Missing response
/// bytes read as zero and a missing mask is all ones.
pub fn masked_mismatch(response: &[u8], mask: Option<&[u8]>, expected: &[u8]) -> bool {
    expected.iter().enumerate().any(|(i, &e)| {
        let r = response.get(i).copied().unwrap_or(0);
        let m = mask.and_then(|m| m.get(i)).copied().unwrap_or(0xFF);
        r & m != e
    })
}

/// Format bytes as hex with the last byte first, matching vendor SVF dumps.
pub fn hex_reversed(bytes: &[u8]) -> String {
    bytes.iter().rev().map(|b| format!("{:02X}", b)).collect()
}

/// JTAG TAP driven through a `Transport`.
pub struct Tap<T: Transport, C: Clock = SystemClock> {
    transport: T,
    clock: C,
    /// None after a transport error or before the first reset.
    state: Option<TapState>,
    mode: Mode,
    mismatches: usize,
}

impl<T: Transport> Tap<T, SystemClock> {
    pub fn new(transport: T) -> Self {
        Self::with_clock(transport, SystemClock::new())
    }
}

impl<T: Transport, C: Clock> Tap<T, C> {
    pub fn with_clock(transport: T, clock: C) -> Self {
        Tap { transport, clock, state: None, mode: Mode::Bit, mismatches: 0 }
    }

    /// Current TAP state, or None if it is not known.
    pub fn state(&self) -> Option<TapState> {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Number of DR compare mismatches reported so far.
    pub fn mismatches(&self) -> usize {
        self.mismatches
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Take the JTAG lines. The TAP state is unknown until `reset()`.
    pub fn acquire(&mut self) -> Result<()> {
        self.io(|t| t.acquire())?;
        self.state = None;
        self.mode = Mode::Bit;
        Ok(())
    }

    pub fn release(&mut self) -> Result<()> {
        self.state = None;
        self.mode = Mode::Bit;
        self.io(|t| t.release())
    }

    pub fn set_block_clock(&mut self, hz: u32) -> Result<()> {
        self.io(|t| t.set_block_clock(hz))
    }

    pub fn sleep(&mut self, duration: Duration) {
        self.clock.sleep(duration);
    }

    /// Six TMS=1 clocks. Exit: Test-Logic-Reset, from any state.
    pub fn reset(&mut self) -> Result<()> {
        self.require_mode(Mode::Bit)?;
        for _ in 0..6 {
            self.step(true)?;
        }
        self.state = Some(TapState::TestLogicReset);
        Ok(())
    }

    /// Dwell in Run-Test/Idle for at least `count` TCK cycles and at least `duration`.
    ///
    /// Entry: any state whose TMS=0 transition is Run-Test/Idle. Exit: Select-DR-Scan.
    pub fn idle(&mut self, count: u32, duration: Duration) -> Result<()> {
        match self.state {
            Some(s) if s.next(false) == TapState::RunTestIdle => (),
            actual => return Err(self.state_error(TapState::RunTestIdle, actual)),
        }
        let deadline = self.clock.now() + duration;
        for _ in 0..count {
            self.step(false)?;
        }
        if !duration.is_zero() {
            while self.clock.now() < deadline {
                self.step(false)?;
            }
        }
        self.step(true)
    }

    /// Shift `data` into IR, LSB first. Entry and exit: Select-DR-Scan.
    ///
    /// The walk passes through Pause-IR before Update-IR, as ECP5 SVF files do.
    pub fn shift_ir(&mut self, data: &[u8], idle: Option<Idle>) -> Result<()> {
        self.require_state(TapState::SelectDrScan)?;
        if data.is_empty() {
            return Err(Error::EmptyShift);
        }
        log::trace!("SIR {}", hex_reversed(data));
        self.step(true)?;           // Select-IR-Scan
        self.step(false)?;          // Capture-IR
        self.step(false)?;          // Shift-IR
        self.shift_bytes(data, BitOrder::LsbFirst, true)?;
        self.step(false)?;          // Pause-IR
        self.step(true)?;           // Exit2-IR
        self.step(true)?;           // Update-IR
        self.finish(idle)
    }

    /// Perform a full DR scan. Entry and exit: Select-DR-Scan.
    ///
    /// Returns the captured bytes and whether the optional compare passed.
    pub fn scan_dr(&mut self, scan: &DrScan) -> Result<(Vec<u8>, bool)> {
        self.require_state(TapState::SelectDrScan)?;
        if scan.data.is_empty() {
            return Err(Error::EmptyShift);
        }
        self.step(false)?;          // Capture-DR
        self.step(false)?;          // Shift-DR
        let captured = self.shift_bytes(scan.data, BitOrder::LsbFirst, true)?;
        log::trace!("SDR {} -> {}", hex_reversed(scan.data), hex_reversed(&captured));
        self.step(false)?;          // Pause-DR
        if !scan.pause.is_zero() {
            self.clock.sleep(scan.pause);
        }
        self.step(true)?;           // Exit2-DR
        self.step(true)?;           // Update-DR
        self.finish(scan.idle)?;

        let ok = match scan.expected {
            Some(expected) if masked_mismatch(&captured, scan.mask, expected) => {
                self.mismatches += 1;
                match scan.mask {
                    Some(mask) => log::warn!("0x{} & 0x{} != 0x{} ({})", hex_reversed(&captured),
                                             hex_reversed(mask), hex_reversed(expected), scan.label),
                    None => log::warn!("0x{} != 0x{} ({})", hex_reversed(&captured),
                                       hex_reversed(expected), scan.label),
                }
                false
            },
            _ => true,
        };
        Ok((captured, ok))
    }

    /// Shift `data` through DR without a compare, returning the captured bytes.
    pub fn shift_dr(&mut self, data: &[u8], idle: Option<Idle>) -> Result<Vec<u8>> {
        let mut scan = DrScan::new(data);
        scan.idle = idle;
        self.scan_dr(&scan).map(|(captured, _)| captured)
    }

    /// Clock once with the given TMS level.
    pub fn tms(&mut self, level: bool) -> Result<()> {
        self.step(level)
    }

    /// Select-DR-Scan to Shift-DR, for scans assembled by hand.
    pub fn enter_shift_dr(&mut self) -> Result<()> {
        self.require_state(TapState::SelectDrScan)?;
        self.step(false)?;
        self.step(false)
    }

    /// Shift whole bytes MSB first while in Shift-DR.
    ///
    /// If `exit` is set, TMS rises with the final bit and the TAP ends in Exit1-DR.
    pub fn shift_msb(&mut self, data: &[u8], exit: bool) -> Result<Vec<u8>> {
        self.require_state(TapState::ShiftDr)?;
        if data.is_empty() {
            return Err(Error::EmptyShift);
        }
        self.shift_bytes(data, BitOrder::MsbFirst, exit)
    }

    /// Shift the top `nbits` bits of `value` MSB first while in Shift-DR.
    pub fn shift_bits(&mut self, value: u8, nbits: u8, exit: bool) -> Result<u8> {
        self.require_state(TapState::ShiftDr)?;
        self.require_mode(Mode::Bit)?;
        self.shift_byte(value, nbits, BitOrder::MsbFirst, exit)
    }

    /// Clock `n` times with TMS and TDI low.
    pub fn clock_cycles(&mut self, n: usize) -> Result<()> {
        self.require_mode(Mode::Bit)?;
        self.io(|t| t.set_signal(Signal::Tdi, false))?;
        for _ in 0..n {
            self.step(false)?;
        }
        Ok(())
    }

    /// Hand the data lines to the block shifter while in Shift-DR.
    ///
    /// The switch clocks one bit with TDI at `tdi`.
    pub fn enter_block_mode(&mut self, tdi: bool) -> Result<()> {
        self.require_state(TapState::ShiftDr)?;
        self.require_mode(Mode::Bit)?;
        self.io(|t| {
            t.set_signal(Signal::Tms, false)?;
            t.set_signal(Signal::Tdi, tdi)?;
            t.enter_block_mode()
        })?;
        self.mode = Mode::Block;
        Ok(())
    }

    /// Return to bit-level control while in Shift-DR.
    ///
    /// The switch clocks one bit with TDI at `tdi`.
    pub fn enter_bit_mode(&mut self, tdi: bool) -> Result<()> {
        self.require_state(TapState::ShiftDr)?;
        self.require_mode(Mode::Block)?;
        self.io(|t| t.enter_bit_mode(tdi))?;
        self.mode = Mode::Bit;
        Ok(())
    }

    pub fn write_block(&mut self, data: &[u8]) -> Result<()> {
        self.require_state(TapState::ShiftDr)?;
        self.require_mode(Mode::Block)?;
        self.io(|t| t.write_block(data))
    }

    pub fn read_block(&mut self, len: usize) -> Result<Vec<u8>> {
        self.require_state(TapState::ShiftDr)?;
        self.require_mode(Mode::Block)?;
        self.io(|t| t.read_block(len))
    }

    /// Finish a hand-assembled DR scan. Entry: Exit1-DR. Exit: Select-DR-Scan.
    pub fn update_dr(&mut self, pause: Duration, idle: Option<Idle>) -> Result<()> {
        self.require_state(TapState::Exit1Dr)?;
        self.step(false)?;          // Pause-DR
        if !pause.is_zero() {
            self.clock.sleep(pause);
        }
        self.step(true)?;           // Exit2-DR
        self.step(true)?;           // Update-DR
        self.finish(idle)
    }

    /// Get back to Test-Logic-Reset from any state and mode.
    pub fn recover(&mut self) -> Result<()> {
        if self.mode == Mode::Block {
            self.state = None;
            self.io(|t| t.enter_bit_mode(false))?;
            self.mode = Mode::Bit;
        }
        self.reset()
    }

    fn finish(&mut self, idle: Option<Idle>) -> Result<()> {
        match idle {
            Some(idle) => self.idle(idle.count + 1, idle.duration),
            None => self.step(true),
        }
    }

    fn step(&mut self, tms: bool) -> Result<()> {
        self.require_mode(Mode::Bit)?;
        self.io(|t| {
            t.set_signal(Signal::Tms, tms)?;
            t.pulse_clock()
        })?;
        self.state = self.state.map(|s| s.next(tms));
        Ok(())
    }

    fn shift_byte(&mut self, value: u8, nbits: u8, order: BitOrder, exit: bool) -> Result<u8> {
        let captured = self.io(|t| transport::shift_bits(t, value, nbits, order, exit))?;
        if exit && nbits > 0 {
            self.state = self.state.map(|s| s.next(true));
        }
        Ok(captured)
    }

    fn shift_bytes(&mut self, data: &[u8], order: BitOrder, exit: bool) -> Result<Vec<u8>> {
        self.require_mode(Mode::Bit)?;
        let last = data.len() - 1;
        data.iter().enumerate()
            .map(|(i, &byte)| self.shift_byte(byte, 8, order, exit && i == last))
            .collect()
    }

    /// Run a transport operation; any failure leaves the TAP state unknown.
    fn io<R>(&mut self, f: impl FnOnce(&mut T) -> transport::Result<R>) -> Result<R> {
        f(&mut self.transport).map_err(|e| {
            self.state = None;
            Error::Transport(e)
        })
    }

    fn require_state(&self, expected: TapState) -> Result<()> {
        match self.state {
            Some(state) if state == expected => Ok(()),
            actual => Err(self.state_error(expected, actual)),
        }
    }

    fn state_error(&self, expected: TapState, actual: Option<TapState>) -> Error {
        log::error!("TAP is in {:?}, expected {:?}", actual, expected);
        Error::TapState { expected, actual }
    }

    fn require_mode(&self, expected: Mode) -> Result<()> {
        if self.mode == expected {
            Ok(())
        } else {
            log::error!("Transport is in {:?} mode, expected {:?}", self.mode, expected);
            Err(Error::WrongMode { expected, actual: self.mode })
        }
    }
}
