// Copyright 2026 ecp5jtag contributors
// Licensed under the Apache-2.0 and MIT licenses.

//! Wire-level model of an ECP5 TAP with an SPI flash behind LSC_PROG_SPI,
//! plus a fake millisecond clock. Only built for tests.

use std::time::Duration;
use anyhow::anyhow;
use crate::jtag::TapState;
use crate::transport::{self, BitOrder, Clock, Error, Signal, Transport};

/// Status register bits the model drives.
const STATUS_DONE: u32 = 1 << 8;
const STATUS_ISC_ENABLE: u32 = 1 << 9;
const STATUS_FAIL: u32 = 1 << 13;

/// Clock which advances 1ms every time it is read.
#[derive(Default)]
pub struct FakeClock {
    now: Duration,
    pub slept: Duration,
}

impl Clock for FakeClock {
    fn now(&mut self) -> Duration {
        self.now += Duration::from_millis(1);
        self.now
    }

    fn sleep(&mut self, duration: Duration) {
        self.now += duration;
        self.slept += duration;
    }
}

/// SPI NOR flash with a write-enable latch and a busy countdown.
///
/// Bits arrive MSB first while the TAP sits in Shift-DR; the frame is
/// executed when Shift-DR is left, which is when the ECP5 releases CS.
pub struct SimFlash {
    pub mem: Vec<u8>,
    pub wel: bool,
    /// Number of status reads which will still report WIP.
    pub busy: u32,
    /// Value `busy` is set to after every erase or page program.
    pub busy_after_op: u32,
    /// Report WIP forever.
    pub stuck: bool,
    pub erases: Vec<u32>,
    pub programs: Vec<u32>,
    pub status_reads: usize,
    pub write_disables: usize,
    /// Frames which ended partway through a byte.
    pub partial_frames: usize,
    frame: Vec<u8>,
    byte: u8,
    nbits: u8,
}

impl SimFlash {
    pub fn new(size: usize) -> Self {
        SimFlash {
            mem: vec![0xFF; size],
            wel: false,
            busy: 0,
            busy_after_op: 0,
            stuck: false,
            erases: Vec::new(),
            programs: Vec::new(),
            status_reads: 0,
            write_disables: 0,
            partial_frames: 0,
            frame: Vec::new(),
            byte: 0,
            nbits: 0,
        }
    }

    pub fn status(&self) -> u8 {
        ((self.busy > 0 || self.stuck) as u8) | ((self.wel as u8) << 1)
    }

    fn address(&self) -> usize {
        let a = &self.frame[1..4];
        ((a[0] as usize) << 16) | ((a[1] as usize) << 8) | a[2] as usize
    }

    fn output_byte(&self, index: usize) -> u8 {
        if index == 0 {
            return 0;
        }
        let len = self.mem.len();
        match self.frame[0] {
            0x05 => self.status(),
            0x03 if index >= 4 => self.mem[(self.address() + index - 4) % len],
            0x0B if index >= 5 => self.mem[(self.address() + index - 5) % len],
            _ => 0,
        }
    }

    /// Clock one bit in on MOSI, returning the MISO level for that bit.
    fn clock(&mut self, mosi: bool) -> bool {
        let index = self.frame.len();
        let miso = (self.output_byte(index) >> (7 - self.nbits)) & 1 == 1;
        self.byte = (self.byte << 1) | mosi as u8;
        self.nbits += 1;
        if self.nbits == 8 {
            self.frame.push(self.byte);
            self.byte = 0;
            self.nbits = 0;
        }
        miso
    }

    /// Run one complete CS frame, MSB first, returning the MISO bytes.
    pub fn exchange(&mut self, mosi: &[u8]) -> Vec<u8> {
        let mut miso = Vec::with_capacity(mosi.len());
        for &byte in mosi {
            let mut rx = 0u8;
            for bit in (0..8).rev() {
                rx = (rx << 1) | self.clock((byte >> bit) & 1 == 1) as u8;
            }
            miso.push(rx);
        }
        self.end_frame();
        miso
    }

    fn end_frame(&mut self) {
        if self.nbits != 0 {
            self.partial_frames += 1;
            self.byte = 0;
            self.nbits = 0;
        }
        if self.frame.is_empty() {
            return;
        }
        match self.frame[0] {
            0x06 => self.wel = true,
            0x04 => {
                self.wel = false;
                self.write_disables += 1;
            },
            0x05 => {
                self.status_reads += 1;
                self.busy = self.busy.saturating_sub(1);
            },
            opcode @ (0x20 | 0x52 | 0xD8) if self.frame.len() >= 4 && self.wel => {
                let size = match opcode { 0x20 => 4096, 0x52 => 32768, _ => 65536 };
                let addr = self.address();
                let base = (addr & !(size - 1)) % self.mem.len();
                let end = usize::min(base + size, self.mem.len());
                self.mem[base..end].fill(0xFF);
                self.erases.push(addr as u32);
                self.wel = false;
                self.busy = self.busy_after_op;
            },
            0x02 if self.frame.len() > 4 && self.wel => {
                let addr = self.address();
                let base = addr & !0xFF;
                let len = self.mem.len();
                for (i, byte) in self.frame[4..].iter().enumerate() {
                    let a = (base + ((addr + i) & 0xFF)) % len;
                    self.mem[a] &= byte;
                }
                self.programs.push(addr as u32);
                self.wel = false;
                self.busy = self.busy_after_op;
            },
            _ => (),
        }
        self.frame.clear();
    }
}

/// ECP5 TAP model implementing `Transport` at the signal level.
pub struct SimTarget {
    pub idcode: u32,
    pub usercode: u32,
    pub status: u32,
    /// Make ISC_DISABLE flag a configuration failure instead of DONE.
    pub fail_bitstream: bool,
    pub flash: SimFlash,
    pub state: TapState,
    pub ir: u8,
    pub ir_log: Vec<u8>,
    /// (IR, captured DR bytes) for every Update-DR, LSB first.
    pub dr_log: Vec<(u8, Vec<u8>)>,
    /// Every bit shifted into DR during LSC_BITSTREAM_BURST.
    pub bitstream: Vec<bool>,
    pub spi_unlocked: bool,
    pub isc_enabled: bool,
    pub refreshed: usize,
    pub acquired: bool,
    pub releases: usize,
    pub pulses: usize,
    pub tms_low_pulses: usize,
    /// Return a line error on this rising edge (1-based).
    pub fail_at_pulse: Option<usize>,
    pub block_switches: usize,
    pub block_bytes: usize,
    tck: bool,
    tms: bool,
    tdi: bool,
    tdo: bool,
    shift_in: Vec<bool>,
    shift_out: Vec<bool>,
}

impl SimTarget {
    pub fn new() -> Self {
        SimTarget {
            idcode: 0x21111043,
            usercode: 0,
            status: 0,
            fail_bitstream: false,
            flash: SimFlash::new(128 * 1024),
            state: TapState::TestLogicReset,
            ir: 0xE0,
            ir_log: Vec::new(),
            dr_log: Vec::new(),
            bitstream: Vec::new(),
            spi_unlocked: false,
            isc_enabled: false,
            refreshed: 0,
            acquired: false,
            releases: 0,
            pulses: 0,
            tms_low_pulses: 0,
            fail_at_pulse: None,
            block_switches: 0,
            block_bytes: 0,
            tck: false,
            tms: false,
            tdi: false,
            tdo: false,
            shift_in: Vec::new(),
            shift_out: Vec::new(),
        }
    }

    /// Pack received bitstream bits MSB first, skipping the first `skip` bits.
    pub fn bitstream_bytes(&self, skip: usize) -> Vec<u8> {
        self.bitstream[skip..].chunks_exact(8)
            .map(|bits| bits.iter().fold(0, |acc, &b| (acc << 1) | b as u8))
            .collect()
    }

    fn passthrough(&self) -> bool {
        self.ir == 0x3A && self.spi_unlocked
    }

    fn rising_edge(&mut self) -> transport::Result<()> {
        self.pulses += 1;
        if self.fail_at_pulse == Some(self.pulses) {
            return Err(Error::Line(anyhow!("simulated line failure")));
        }
        if !self.tms {
            self.tms_low_pulses += 1;
        }

        if matches!(self.state, TapState::ShiftIr | TapState::ShiftDr) {
            if self.state == TapState::ShiftDr && self.passthrough() {
                self.tdo = self.flash.clock(self.tdi);
            } else if self.shift_out.is_empty() {
                self.tdo = false;
            } else {
                self.tdo = self.shift_out.remove(0);
            }
            self.shift_in.push(self.tdi);
        }

        let next = self.state.next(self.tms);
        if self.state == TapState::ShiftDr && next != TapState::ShiftDr && self.passthrough() {
            self.flash.end_frame();
        }
        self.state = next;

        match next {
            TapState::TestLogicReset => self.ir = 0xE0,
            TapState::CaptureIr => {
                self.shift_in.clear();
                self.shift_out.clear();
            },
            TapState::CaptureDr => {
                self.shift_in.clear();
                self.shift_out = match self.ir {
                    0xE0 => bits(self.idcode),
                    0xC0 => bits(self.usercode),
                    0x3C => bits(self.status),
                    _ => Vec::new(),
                };
            },
            TapState::UpdateIr => self.update_ir(),
            TapState::UpdateDr => self.update_dr(),
            _ => (),
        }
        Ok(())
    }

    fn update_ir(&mut self) {
        let n = self.shift_in.len();
        let last = &self.shift_in[n.saturating_sub(8)..];
        self.ir = last.iter().enumerate().fold(0, |acc, (i, &b)| acc | ((b as u8) << i));
        self.ir_log.push(self.ir);
        match self.ir {
            0x26 if self.isc_enabled => {
                self.isc_enabled = false;
                self.status &= !STATUS_ISC_ENABLE;
                if self.fail_bitstream || self.bitstream.is_empty() {
                    self.status |= STATUS_FAIL;
                } else {
                    self.status |= STATUS_DONE;
                }
            },
            0x79 => {
                self.refreshed += 1;
                self.spi_unlocked = false;
            },
            _ => (),
        }
    }

    fn update_dr(&mut self) {
        let bytes: Vec<u8> = self.shift_in.chunks(8)
            .map(|c| c.iter().enumerate().fold(0, |acc, (i, &b)| acc | ((b as u8) << i)))
            .collect();
        match self.ir {
            0xC6 => {
                self.isc_enabled = true;
                self.status |= STATUS_ISC_ENABLE;
            },
            0x0E => {
                self.status &= !(STATUS_DONE | STATUS_FAIL);
                self.bitstream.clear();
            },
            0x7A => self.bitstream = self.shift_in.clone(),
            0x3A if !self.spi_unlocked => {
                self.spi_unlocked = bytes.len() == 2 && u16::from_le_bytes([bytes[0], bytes[1]]) == 0x68FE;
            },
            _ => (),
        }
        self.dr_log.push((self.ir, bytes));
    }
}

fn bits(value: u32) -> Vec<bool> {
    (0..32).map(|i| (value >> i) & 1 == 1).collect()
}

impl Transport for SimTarget {
    fn acquire(&mut self) -> transport::Result<()> {
        self.acquired = true;
        Ok(())
    }

    fn release(&mut self) -> transport::Result<()> {
        self.acquired = false;
        self.releases += 1;
        Ok(())
    }

    fn set_signal(&mut self, signal: Signal, level: bool) -> transport::Result<()> {
        match signal {
            Signal::Tms => self.tms = level,
            Signal::Tdi => self.tdi = level,
            Signal::Tck => {
                if level && !self.tck {
                    self.rising_edge()?;
                }
                self.tck = level;
            },
        }
        Ok(())
    }

    fn read_tdo(&mut self) -> transport::Result<bool> {
        Ok(self.tdo)
    }

    fn enter_block_mode(&mut self) -> transport::Result<()> {
        self.block_switches += 1;
        self.pulse_clock()
    }

    fn enter_bit_mode(&mut self, tdi: bool) -> transport::Result<()> {
        self.block_switches += 1;
        self.set_signal(Signal::Tdi, tdi)?;
        self.pulse_clock()
    }

    fn write_block(&mut self, data: &[u8]) -> transport::Result<()> {
        self.block_bytes += data.len();
        for byte in data {
            transport::shift_bits(self, *byte, 8, BitOrder::MsbFirst, false)?;
        }
        Ok(())
    }

    fn read_block(&mut self, len: usize) -> transport::Result<Vec<u8>> {
        self.block_bytes += len;
        (0..len).map(|_| transport::shift_bits(self, 0, 8, BitOrder::MsbFirst, false)).collect()
    }
}
