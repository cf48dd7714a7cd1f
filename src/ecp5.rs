// Copyright 2026 ecp5jtag contributors
// Licensed under the Apache-2.0 and MIT licenses.

//! This module implements ECP5-specific functionality on top of a JTAG TAP:
//! reading the IDCODE, loading a bitstream into SRAM, and reaching the
//! configuration SPI flash through the LSC_PROG_SPI passthrough.

use std::convert::TryFrom;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::time::{Duration, Instant};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::flash::{self, Flash, FlashAccess, FlashGeometry, Error as FlashError};
use crate::jtag::{DrScan, Idle, Tap, TapState, Error as JTAGError};
use crate::transport::{Clock, Mode, SystemClock, Transport};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("JTAG error")]
    JTAG(#[from] JTAGError),
    #[error("Flash error")]
    Flash(#[from] FlashError),
    #[error("Bitstream is empty.")]
    EmptyBitstream,
    #[error("Error reading bitstream")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[allow(non_camel_case_types)]
#[repr(u32)]
pub enum ECP5IDCODE {
    LFE5U_12 = 0x21111043,
    LFE5U_25 = 0x41111043,
    LFE5U_45 = 0x41112043,
    LFE5U_85 = 0x41113043,
    LFE5UM_25 = 0x01111043,
    LFE5UM_45 = 0x01112043,
    LFE5UM_85 = 0x01113043,
    LFE5UM5G_25 = 0x81111043,
    LFE5UM5G_45 = 0x81112043,
    LFE5UM5G_85 = 0x81113043,
}

impl ECP5IDCODE {
    pub fn try_from_idcode(idcode: u32) -> Option<Self> {
        Self::try_from(idcode).ok()
    }

    pub fn name(&self) -> &'static str {
        match self {
            ECP5IDCODE::LFE5U_12 => "LFE5U-12",
            ECP5IDCODE::LFE5U_25 => "LFE5U-25",
            ECP5IDCODE::LFE5U_45 => "LFE5U-45",
            ECP5IDCODE::LFE5U_85 => "LFE5U-85",
            ECP5IDCODE::LFE5UM_25 => "LFE5UM-25",
            ECP5IDCODE::LFE5UM_45 => "LFE5UM-45",
            ECP5IDCODE::LFE5UM_85 => "LFE5UM-85",
            ECP5IDCODE::LFE5UM5G_25 => "LFE5UM5G-25",
            ECP5IDCODE::LFE5UM5G_45 => "LFE5UM5G-45",
            ECP5IDCODE::LFE5UM5G_85 => "LFE5UM5G-85",
        }
    }
}

/// ECP5 JTAG instructions.
#[derive(Copy, Clone, Debug, IntoPrimitive)]
#[allow(non_camel_case_types)]
#[repr(u8)]
enum Command {
    READ_ID = 0xE0,
    USERCODE = 0xC0,
    LSC_PRELOAD = 0x1C,
    ISC_ENABLE = 0xC6,
    LSC_READ_STATUS = 0x3C,
    ISC_ERASE = 0x0E,
    LSC_INIT_ADDRESS = 0x46,
    LSC_BITSTREAM_BURST = 0x7A,
    ISC_DISABLE = 0x26,
    BYPASS = 0xFF,
    LSC_REFRESH = 0x79,
    LSC_PROG_SPI = 0x3A,
}

impl Command {
    /// Instruction register contents.
    fn ir(self) -> [u8; 1] {
        [self.into()]
    }
}

/// Key which unlocks the SPI passthrough after LSC_PROG_SPI.
const PROG_SPI_KEY: u16 = 0x68FE;

/// Status register bits which must be clear after ISC_ENABLE.
const STATUS_ENABLE_MASK: u32 = 0x0002_4040;
/// Status register bits which must be clear after ISC_ERASE.
const STATUS_ERASE_MASK: u32 = 0x0000_B000;
/// DONE and FAIL: after configuration DONE must be set and FAIL clear.
const STATUS_DONE_MASK: u32 = 0x0000_2100;
const STATUS_DONE: u32 = 0x0000_0100;

/// Bitstream bytes read from the source per block transfer.
const STREAM_CHUNK: usize = 16384;

/// ECP5 status register.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Status(pub u32);

impl Status {
    pub fn done(&self) -> bool {
        ((self.0 >> 8) & 1) == 1
    }

    pub fn isc_enable(&self) -> bool {
        ((self.0 >> 9) & 1) == 1
    }

    pub fn busy(&self) -> bool {
        ((self.0 >> 12) & 1) == 1
    }

    pub fn fail(&self) -> bool {
        ((self.0 >> 13) & 1) == 1
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status(0x{:08X}, DONE={}, ISC={}, BUSY={}, FAIL={})",
               self.0, self.done(), self.isc_enable(), self.busy(), self.fail())
    }
}

/// Options for sessions opened by `ECP5`.
#[derive(Copy, Clone, Debug)]
pub struct Ecp5Config {
    /// Stream bulk data with block transfers instead of bit-level shifting.
    pub block_mode: bool,
    /// TCK frequency for block transfers.
    pub spi_clock_hz: u32,
    /// Flash status polls before giving up on an erase or write.
    pub poll_retries: u32,
    pub poll_interval: Duration,
    pub geometry: FlashGeometry,
}

impl Default for Ecp5Config {
    fn default() -> Self {
        Ecp5Config {
            block_mode: true,
            spi_clock_hz: 30_000_000,
            poll_retries: 10,
            poll_interval: Duration::from_millis(100),
            geometry: FlashGeometry::default(),
        }
    }
}

/// ECP5 FPGA attached by JTAG as the only device on the chain.
pub struct ECP5<T: Transport, C: Clock = SystemClock> {
    tap: Tap<T, C>,
    config: Ecp5Config,
}

impl<T: Transport> ECP5<T, SystemClock> {
    pub fn new(transport: T, config: Ecp5Config) -> Self {
        ECP5 { tap: Tap::new(transport), config }
    }
}

impl<T: Transport, C: Clock> ECP5<T, C> {
    pub fn with_clock(transport: T, clock: C, config: Ecp5Config) -> Self {
        ECP5 { tap: Tap::with_clock(transport, clock), config }
    }

    pub fn config(&self) -> &Ecp5Config {
        &self.config
    }

    pub fn tap(&self) -> &Tap<T, C> {
        &self.tap
    }

    pub fn into_inner(self) -> T {
        self.tap.into_inner()
    }

    /// Read the 32-bit IDCODE.
    pub fn idcode(&mut self) -> Result<u32> {
        self.bracket(|tap| {
            tap.reset()?;
            tap.idle(1, Duration::ZERO)?;
            tap.shift_ir(&Command::READ_ID.ir(), None)?;
            let id = tap.shift_dr(&[0; 4], None)?;
            Ok(le_u32(&id))
        })
    }

    /// Read the configuration status register.
    pub fn status(&mut self) -> Result<Status> {
        self.bracket(|tap| {
            tap.reset()?;
            tap.idle(1, Duration::ZERO)?;
            tap.shift_ir(&Command::LSC_READ_STATUS.ir(), None)?;
            let status = Status(le_u32(&tap.shift_dr(&[0; 4], None)?));
            tap.reset()?;
            Ok(status)
        })
    }

    /// Request the ECP5 reload its configuration from flash.
    pub fn refresh(&mut self) -> Result<()> {
        log::debug!("Issuing LSC_REFRESH");
        self.bracket(|tap| {
            tap.reset()?;
            tap.idle(1, Duration::ZERO)?;
            tap.shift_ir(&Command::LSC_REFRESH.ir(), None)?;
            tap.shift_dr(&[0; 3], Some(Idle::new(2, Duration::from_millis(100))))?;
            tap.reset()?;
            Ok(())
        })
    }

    /// Open a configuration session, leaving the ECP5 ready to receive a bitstream.
    pub fn configure(&mut self) -> Result<ConfigSession<'_, T, C>> {
        ConfigSession::open(&mut self.tap, &self.config)
    }

    /// Open a session with the SPI flash reachable through DR scans.
    pub fn flash(&mut self) -> Result<FlashSession<'_, T, C>> {
        FlashSession::open(&mut self.tap, &self.config)
    }

    /// Load `bitstream` into SRAM. Returns whether the ECP5 reported DONE without FAIL.
    pub fn program<R: Read>(&mut self, bitstream: R) -> Result<bool> {
        self.program_cb(bitstream, |_| {})
    }

    /// As `program()`, calling `cb` with the number of bytes uploaded so far.
    pub fn program_cb<R: Read, F: FnMut(usize)>(&mut self, bitstream: R, cb: F) -> Result<bool> {
        let mut bitstream = BufReader::new(bitstream);
        if bitstream.fill_buf()?.is_empty() {
            log::error!("Refusing to program an empty bitstream");
            return Err(Error::EmptyBitstream);
        }
        let t0 = Instant::now();
        let mut session = self.configure()?;
        let streamed = session.stream(bitstream, cb);
        let outcome = session.finish();
        let bytes = streamed?;
        flash::log_rate(bytes, t0.elapsed());
        outcome
    }

    /// As `program()`, drawing a progress bar to the terminal.
    pub fn program_progress(&mut self, data: &[u8]) -> Result<bool> {
        let pb = flash::progress_bar(data.len() as u64, "Programming");
        let result = self.program_cb(data, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Fast-read `length` bytes of flash starting at `address`.
    pub fn flash_read(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let mut session = self.flash()?;
        let data = session.flash().fast_read(address, length);
        let outcome = session.finish();
        let data = data?;
        outcome?;
        Ok(data)
    }

    /// As `flash_read()`, drawing a progress bar to the terminal.
    pub fn flash_read_progress(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let mut session = self.flash()?;
        let data = session.flash().read_progress(address, length);
        let outcome = session.finish();
        let data = data?;
        outcome?;
        Ok(data)
    }

    /// Write `image` to flash at `address`, which must be erase-block aligned.
    ///
    /// If `force` is set every block is erased and rewritten, otherwise blocks are
    /// compared first and only erased or written when needed.
    /// Returns whether the flash reported idle with write-enable clear at the end.
    pub fn flash_program<R: Read>(&mut self, address: u32, image: R, force: bool)
        -> Result<bool>
    {
        self.flash_program_cb(address, image, force, |_| {})
    }

    /// As `flash_program()`, calling `cb` with the number of bytes processed so far.
    pub fn flash_program_cb<R: Read, F: FnMut(usize)>(
        &mut self, address: u32, image: R, force: bool, cb: F,
    ) -> Result<bool> {
        flash::check_aligned(address, self.config.geometry.erase_size())?;
        let mut image = BufReader::new(image);
        if image.fill_buf()?.is_empty() {
            log::error!("Refusing to program an empty image");
            return Err(FlashError::EmptyImage.into());
        }
        let mut session = self.flash()?;
        let result = if force {
            session.flash().program_forced_cb(address, image, cb)
        } else {
            session.flash().program_wear_aware_cb(address, image, cb)
        };
        let outcome = session.finish();
        let stats = result?;
        log::debug!("{:?}", stats);
        outcome
    }

    /// As `flash_program()`, drawing a progress bar to the terminal.
    pub fn flash_program_progress(&mut self, address: u32, data: &[u8], force: bool)
        -> Result<bool>
    {
        flash::check_aligned(address, self.config.geometry.erase_size())?;
        flash::check_range(address, data.len())?;
        if data.is_empty() {
            return Err(FlashError::EmptyImage.into());
        }
        let mut session = self.flash()?;
        let result = session.flash().program_progress(address, data, force);
        let outcome = session.finish();
        result?;
        outcome
    }

    /// Acquire the transport around `f`, releasing it whatever `f` returns.
    fn bracket<R, F>(&mut self, f: F) -> Result<R>
        where F: FnOnce(&mut Tap<T, C>) -> std::result::Result<R, JTAGError>
    {
        self.tap.acquire()?;
        let result = f(&mut self.tap);
        let released = self.tap.release();
        let value = result?;
        released?;
        Ok(value)
    }
}

/// Shared ISC_ENABLE / ISC_ERASE handshake. Entry and exit: Select-DR-Scan.
fn enable_configuration<T: Transport, C: Clock>(tap: &mut Tap<T, C>) -> Result<()> {
    let zeros = [0u8; 4];
    tap.shift_ir(&Command::LSC_PRELOAD.ir(), None)?;
    tap.shift_dr(&[0xFF; 64], None)?;
    tap.shift_ir(&Command::ISC_ENABLE.ir(), None)?;
    tap.shift_dr(&[0x00], Some(Idle::new(2, Duration::from_millis(10))))?;
    tap.shift_ir(&Command::LSC_READ_STATUS.ir(), Some(Idle::new(2, Duration::from_millis(1))))?;
    tap.scan_dr(&DrScan::new(&zeros).mask(&STATUS_ENABLE_MASK.to_le_bytes())
                .expect(&zeros).label("FAIL status"))?;
    tap.shift_ir(&Command::ISC_ERASE.ir(), None)?;
    tap.shift_dr(&[0x01], Some(Idle::new(2, Duration::from_millis(10))))?;
    tap.shift_ir(&Command::LSC_READ_STATUS.ir(), Some(Idle::new(2, Duration::from_millis(1))))?;
    tap.scan_dr(&DrScan::new(&zeros).mask(&STATUS_ERASE_MASK.to_le_bytes())
                .expect(&zeros).label("FAIL status"))?;
    Ok(())
}

/// Bitstream upload in progress.
///
/// Created by `ECP5::configure()`. Bytes passed to `write()` are streamed straight
/// into the configuration engine. `finish()` ends the upload and reports whether
/// the ECP5 accepted the bitstream; dropping the session ends it too.
pub struct ConfigSession<'a, T: Transport, C: Clock> {
    tap: &'a mut Tap<T, C>,
    block_mode: bool,
    bytes: usize,
    closed: bool,
}

impl<'a, T: Transport, C: Clock> ConfigSession<'a, T, C> {
    fn open(tap: &'a mut Tap<T, C>, config: &Ecp5Config) -> Result<Self> {
        tap.acquire()?;
        let mut session = ConfigSession { tap, block_mode: config.block_mode, bytes: 0, closed: false };
        if let Err(e) = session.open_sequence(config) {
            log::error!("Failed to enter configuration mode: {}", e);
            session.abort();
            return Err(e);
        }
        Ok(session)
    }

    fn open_sequence(&mut self, config: &Ecp5Config) -> Result<()> {
        log::debug!("Entering SRAM configuration mode");
        let tap = &mut *self.tap;
        if config.block_mode {
            tap.set_block_clock(config.spi_clock_hz)?;
        }
        tap.reset()?;
        tap.idle(1, Duration::ZERO)?;
        enable_configuration(tap)?;
        tap.shift_ir(&Command::LSC_INIT_ADDRESS.ir(), None)?;
        tap.shift_dr(&[0x01], Some(Idle::new(2, Duration::from_millis(10))))?;
        tap.shift_ir(&Command::LSC_BITSTREAM_BURST.ir(), None)?;
        tap.enter_shift_dr()?;
        if self.block_mode {
            // The bitstream tolerates leading junk, so the switch clock is harmless.
            tap.enter_block_mode(true)?;
        }
        Ok(())
    }

    /// Stream raw bitstream bytes.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.block_mode {
            self.tap.write_block(data)?;
        } else {
            self.tap.shift_msb(data, false)?;
        }
        self.bytes += data.len();
        Ok(())
    }

    /// Stream everything from `reader`, calling `cb` with the bytes sent so far.
    pub fn stream<R: Read, F: FnMut(usize)>(&mut self, mut reader: R, mut cb: F)
        -> Result<usize>
    {
        let mut buf = vec![0u8; STREAM_CHUNK];
        let start = self.bytes;
        loop {
            let n = flash::read_chunk(&mut reader, &mut buf)?;
            self.write(&buf[..n])?;
            cb(self.bytes - start);
            if n < buf.len() {
                break;
            }
        }
        Ok(self.bytes - start)
    }

    /// Bytes streamed so far.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// End the upload and check the ECP5 reports DONE without FAIL.
    pub fn finish(mut self) -> Result<bool> {
        self.close()
    }

    fn close(&mut self) -> Result<bool> {
        self.closed = true;
        let result = self.close_sequence();
        let released = self.tap.release();
        let ok = result?;
        released?;
        Ok(ok)
    }

    fn close_sequence(&mut self) -> Result<bool> {
        log::debug!("Leaving configuration mode after {} bytes", self.bytes);
        let tap = &mut *self.tap;
        if tap.state() == Some(TapState::ShiftDr) {
            if tap.mode() == Mode::Block {
                tap.enter_bit_mode(true)?;
            }
            tap.tms(true)?;             // Exit1-DR
            tap.tms(false)?;            // Pause-DR
            tap.tms(true)?;             // Exit2-DR
            tap.tms(true)?;             // Update-DR
            tap.idle(100, Duration::from_millis(10))?;
        } else {
            log::warn!("TAP state lost during bitstream upload, resetting");
            tap.recover()?;
            tap.idle(1, Duration::ZERO)?;
        }

        let zeros = [0u8; 4];
        tap.shift_ir(&Command::USERCODE.ir(), Some(Idle::new(2, Duration::from_millis(1))))?;
        tap.scan_dr(&DrScan::new(&zeros).expect(&zeros).label("FAIL usercode"))?;
        tap.shift_ir(&Command::ISC_DISABLE.ir(), Some(Idle::new(2, Duration::from_millis(200))))?;
        tap.shift_ir(&Command::BYPASS.ir(), Some(Idle::new(2, Duration::from_millis(1))))?;
        tap.shift_ir(&Command::LSC_READ_STATUS.ir(), None)?;
        let (status, ok) = tap.scan_dr(&DrScan::new(&zeros)
                                       .mask(&STATUS_DONE_MASK.to_le_bytes())
                                       .expect(&STATUS_DONE.to_le_bytes())
                                       .label("FAIL bitstream"))?;
        log::debug!("{:?}", Status(le_u32(&status)));
        tap.reset()?;
        Ok(ok)
    }

    /// Best-effort cleanup after a failed open.
    fn abort(&mut self) {
        self.closed = true;
        if let Err(e) = self.tap.recover() {
            log::warn!("Could not reset TAP: {}", e);
        }
        if let Err(e) = self.tap.release() {
            log::warn!("Could not release transport: {}", e);
        }
    }
}

impl<'a, T: Transport, C: Clock> Drop for ConfigSession<'a, T, C> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                log::error!("Error closing configuration session: {}", e);
            }
        }
    }
}

/// SPI flash access through the ECP5.
///
/// Created by `ECP5::flash()`. While open, every DR scan reaches the flash with
/// chip select asserted for the duration of Shift-DR. `finish()` disables writes,
/// checks the flash is idle, and has the ECP5 reload its configuration.
pub struct FlashSession<'a, T: Transport, C: Clock> {
    tap: &'a mut Tap<T, C>,
    config: Ecp5Config,
    closed: bool,
}

impl<'a, T: Transport, C: Clock> FlashSession<'a, T, C> {
    fn open(tap: &'a mut Tap<T, C>, config: &Ecp5Config) -> Result<Self> {
        tap.acquire()?;
        let mut session = FlashSession { tap, config: *config, closed: false };
        if let Err(e) = session.open_sequence() {
            log::error!("Failed to enter flash passthrough: {}", e);
            session.abort();
            return Err(e);
        }
        Ok(session)
    }

    fn open_sequence(&mut self) -> Result<()> {
        log::debug!("Entering SPI flash passthrough");
        let tap = &mut *self.tap;
        if self.config.block_mode {
            tap.set_block_clock(self.config.spi_clock_hz)?;
        }
        tap.reset()?;
        tap.idle(1, Duration::ZERO)?;
        enable_configuration(tap)?;
        tap.reset()?;
        tap.idle(1, Duration::ZERO)?;
        tap.shift_ir(&Command::BYPASS.ir(), Some(Idle::cycles(32)))?;
        tap.shift_ir(&Command::LSC_PROG_SPI.ir(), None)?;
        tap.shift_dr(&PROG_SPI_KEY.to_le_bytes(), Some(Idle::cycles(32)))?;
        Ok(())
    }

    /// Flash programmer using this session and the configured geometry and polling.
    pub fn flash(&mut self) -> Flash<'_, Self> {
        let geometry = self.config.geometry;
        let (retries, interval) = (self.config.poll_retries, self.config.poll_interval);
        let mut flash = Flash::new(self, geometry);
        flash.set_polling(retries, interval);
        flash
    }

    /// Disable writes, check the flash is idle, and reload the ECP5.
    ///
    /// Returns whether the final flash status showed WIP and WEL clear.
    pub fn finish(mut self) -> Result<bool> {
        self.close()
    }

    fn close(&mut self) -> Result<bool> {
        self.closed = true;
        let result = self.close_sequence();
        let released = self.tap.release();
        let ok = result?;
        released?;
        Ok(ok)
    }

    fn close_sequence(&mut self) -> Result<bool> {
        log::debug!("Leaving SPI flash passthrough");
        let ok = if self.tap.state() == Some(TapState::SelectDrScan)
                    && self.tap.mode() == Mode::Bit {
            let mut flash = self.flash();
            flash.write_disable()?;
            flash.check_status(0x00, "FLASH status")?
        } else {
            log::warn!("TAP state lost during flash access, resetting");
            self.tap.recover()?;
            self.tap.idle(1, Duration::ZERO)?;
            false
        };
        let tap = &mut *self.tap;
        tap.shift_ir(&Command::BYPASS.ir(), Some(Idle::new(100, Duration::from_millis(1))))?;
        tap.shift_ir(&Command::ISC_DISABLE.ir(), Some(Idle::new(2, Duration::from_millis(200))))?;
        tap.shift_ir(&Command::BYPASS.ir(), Some(Idle::new(2, Duration::from_millis(1))))?;
        tap.shift_ir(&Command::LSC_REFRESH.ir(), None)?;
        tap.shift_dr(&[0; 3], Some(Idle::new(2, Duration::from_millis(100))))?;
        tap.reset()?;
        Ok(ok)
    }

    fn abort(&mut self) {
        self.closed = true;
        if let Err(e) = self.tap.recover() {
            log::warn!("Could not reset TAP: {}", e);
        }
        if let Err(e) = self.tap.release() {
            log::warn!("Could not release transport: {}", e);
        }
    }
}

impl<'a, T: Transport, C: Clock> Drop for FlashSession<'a, T, C> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                log::error!("Error closing flash session: {}", e);
            }
        }
    }
}

impl<'a, T: Transport, C: Clock> FlashAccess for FlashSession<'a, T, C> {
    fn scan(&mut self, scan: &DrScan) -> anyhow::Result<(Vec<u8>, bool)> {
        Ok(self.tap.scan_dr(scan)?)
    }

    fn write_raw(&mut self, data: &[u8]) -> anyhow::Result<()> {
        log::trace!("SPI write: {} bytes", data.len());
        self.tap.enter_shift_dr()?;
        self.tap.shift_msb(data, true)?;
        self.tap.update_dr(Duration::ZERO, None)?;
        Ok(())
    }

    /// Shift the first 7 bits and last 7 bits by hand, and everything in between
    /// with block transfers. The two mode-switch clocks carry the bits either side
    /// of the block, so the frame stays byte-exact.
    fn write_raw_fast(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if !self.config.block_mode || data.len() < 2 {
            return self.write_raw(data);
        }
        log::trace!("SPI block write: {} bytes", data.len());
        let (first, last) = (data[0], data[data.len() - 1]);
        let tap = &mut *self.tap;
        tap.enter_shift_dr()?;
        tap.shift_bits(first, 7, false)?;
        tap.enter_block_mode(first & 1 == 1)?;
        tap.write_block(&data[1..data.len() - 1])?;
        tap.enter_bit_mode(last & 0x80 != 0)?;
        tap.shift_bits(last << 1, 7, true)?;
        tap.update_dr(Duration::ZERO, None)?;
        Ok(())
    }

    fn read_raw(&mut self, header: &[u8], len: usize, fast: bool) -> anyhow::Result<Vec<u8>> {
        let tap = &mut *self.tap;
        tap.enter_shift_dr()?;
        let data = match header.split_last() {
            Some((&last, rest)) if self.config.block_mode && len > 0 => {
                if fast {
                    // Seven dummy clocks here, the eighth is the switch into block mode.
                    tap.shift_msb(header, false)?;
                    tap.clock_cycles(7)?;
                    tap.enter_block_mode(false)?;
                } else {
                    if !rest.is_empty() {
                        tap.shift_msb(rest, false)?;
                    }
                    tap.shift_bits(last, 7, false)?;
                    tap.enter_block_mode(last & 1 == 1)?;
                }
                let data = tap.read_block(len)?;
                tap.enter_bit_mode(false)?;
                data
            },
            _ => {
                if !header.is_empty() {
                    tap.shift_msb(header, false)?;
                }
                if fast {
                    tap.clock_cycles(8)?;
                }
                if len > 0 { tap.shift_msb(&vec![0; len], false)? } else { Vec::new() }
            },
        };
        // Trailing dummy byte carries the exit from Shift-DR.
        tap.shift_msb(&[0], true)?;
        tap.update_dr(Duration::ZERO, None)?;
        Ok(data)
    }

    fn delay(&mut self, duration: Duration) {
        self.tap.sleep(duration);
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    for (w, b) in word.iter_mut().zip(bytes) {
        *w = *b;
    }
    u32::from_le_bytes(word)
}
