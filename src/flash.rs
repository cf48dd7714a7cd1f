// Copyright 2026 ecp5jtag contributors
// Licensed under the Apache-2.0 and MIT licenses.

//! SPI NOR flash programming through a JTAG passthrough.
//!
//! Short commands (write enable, status reads) travel as ordinary DR scans,
//! which shift each byte LSB first, so their opcodes are given bit-reversed.
//! Erase, program and read frames are shifted MSB first as raw big-endian data.

use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};
use indicatif::{ProgressBar, ProgressStyle};
use crate::jtag::DrScan;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Address 0x{address:06X} is not aligned to {align} bytes.")]
    Misaligned { address: u32, align: usize },
    #[error("Address out of range for 24-bit addressing.")]
    InvalidAddress,
    #[error("Page writes must be exactly {expected} bytes, got {actual}.")]
    PageLength { expected: usize, actual: usize },
    #[error("No erase instruction for {0} byte blocks (supported: 4096, 32768, 65536).")]
    InvalidEraseSize(usize),
    #[error("Page size {0} must be a power of two no larger than the erase block.")]
    InvalidPageSize(usize),
    #[error("Image is empty.")]
    EmptyImage,
    #[error("Error reading image")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Access(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Trait for objects which can reach an SPI flash through a JTAG data register.
///
/// Each call is one complete DR scan, so one SPI chip-select frame.
/// Providers only need the block-mode path in `write_raw_fast()` if they have one;
/// it defaults to `write_raw()`.
pub trait FlashAccess {
    /// Full DR scan with bytes shifted LSB first, with optional masked compare.
    ///
    /// Returns the captured bytes and whether the compare passed.
    fn scan(&mut self, scan: &DrScan) -> anyhow::Result<(Vec<u8>, bool)>;

    /// Shift `data` MSB first as one frame, discarding TDO.
    fn write_raw(&mut self, data: &[u8]) -> anyhow::Result<()>;

    /// As `write_raw()`, using block transfers for the bulk of the frame.
    fn write_raw_fast(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.write_raw(data)
    }

    /// Shift `header` MSB first, then read `len` bytes in the same frame.
    ///
    /// If `fast` is set, 8 dummy clocks separate the header and the data.
    fn read_raw(&mut self, header: &[u8], len: usize, fast: bool) -> anyhow::Result<Vec<u8>>;

    /// Sleep between status polls.
    fn delay(&mut self, duration: Duration);
}

/// Page and erase block sizes of the attached flash.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlashGeometry {
    page_size: usize,
    erase_size: usize,
    erase_opcode: u8,
}

impl FlashGeometry {
    pub fn new(page_size: usize, erase_size: usize) -> Result<Self> {
        let erase_opcode = erase_opcode(erase_size).ok_or(Error::InvalidEraseSize(erase_size))?;
        if !page_size.is_power_of_two() || page_size > erase_size {
            return Err(Error::InvalidPageSize(page_size));
        }
        Ok(FlashGeometry { page_size, erase_size, erase_opcode })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn erase_size(&self) -> usize {
        self.erase_size
    }

    pub fn erase_opcode(&self) -> u8 {
        self.erase_opcode
    }
}

impl Default for FlashGeometry {
    fn default() -> Self {
        FlashGeometry { page_size: 256, erase_size: 4096, erase_opcode: 0x20 }
    }
}

/// Erase instruction for a given erase block size.
pub fn erase_opcode(erase_size: usize) -> Option<u8> {
    match erase_size {
        4096 => Some(Command::SectorErase.into()),
        32768 => Some(Command::BlockErase1.into()),
        65536 => Some(Command::BlockErase2.into()),
        _ => None,
    }
}

/// Counts reported by the programming loops.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ProgramStats {
    /// Erase blocks covered by the image.
    pub blocks: usize,
    pub erased: usize,
    /// Erase blocks which needed at least one page written.
    pub written: usize,
    pub pages_written: usize,
    pub bytes: usize,
}

/// Status bits as captured by an LSB-first scan, which reverses them:
/// 0x80 is WIP, 0x40 is WEL, 0x01 is SRP.
const STATUS_MASK: u8 = 0xC1;
const STATUS_WEL: u8 = 0x40;

const DATA_PROGRESS_TPL: &str =
    " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
const DATA_PROGRESS_CHARS: &str = "=> ";

/// SPI flash behind a `FlashAccess` provider.
pub struct Flash<'a, A: FlashAccess> {
    access: &'a mut A,
    geometry: FlashGeometry,
    poll_retries: u32,
    poll_interval: Duration,
}

impl<'a, A: FlashAccess> Flash<'a, A> {
    pub fn new(access: &'a mut A, geometry: FlashGeometry) -> Self {
        Flash { access, geometry, poll_retries: 10, poll_interval: Duration::from_millis(100) }
    }

    /// Set how many status polls `wait_status()` makes and the pause between them.
    pub fn set_polling(&mut self, retries: u32, interval: Duration) {
        self.poll_retries = retries;
        self.poll_interval = interval;
    }

    pub fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    /// Send WriteEnable, setting WEL.
    pub fn write_enable(&mut self) -> Result<()> {
        self.command(Command::WriteEnable)
    }

    /// Send WriteDisable, clearing WEL.
    pub fn write_disable(&mut self) -> Result<()> {
        self.command(Command::WriteDisable)
    }

    /// Read status register 1, returned bit-reversed as captured.
    pub fn read_status(&mut self) -> Result<u8> {
        let (captured, _) = self.access.scan(&DrScan::new(&[Command::ReadStatusRegister1.lsb(), 0]))?;
        match captured.get(1) {
            Some(&status) => Ok(status),
            None => Err(anyhow::anyhow!("Status scan returned {} bytes", captured.len()).into()),
        }
    }

    /// Poll until WIP, WEL and SRP are all clear.
    ///
    /// Returns false if the flash was still busy after all retries,
    /// after reporting the final status through a masked compare.
    pub fn wait_status(&mut self) -> Result<bool> {
        for poll in 0..self.poll_retries {
            let status = self.read_status()?;
            if status & STATUS_MASK == 0 {
                log::trace!("Flash ready after {} polls", poll + 1);
                return Ok(true);
            }
            if poll + 1 < self.poll_retries {
                self.access.delay(self.poll_interval);
            }
        }
        log::warn!("Flash still busy after {} status polls", self.poll_retries);
        self.check_status(0x00, "FLASH busy")?;
        Ok(false)
    }

    /// Erase one erase block, which must be aligned to the erase block size.
    pub fn erase_block(&mut self, address: u32) -> Result<()> {
        check_aligned(address, self.geometry.erase_size)?;
        log::debug!("Erasing {} bytes at 0x{:06X}", self.geometry.erase_size, address);
        self.write_enable()?;
        // Some flashes do not clear a stale WIP until status is read with WEL set.
        self.check_status(STATUS_WEL, "FLASH WEL")?;
        self.access.write_raw(&frame_header(self.geometry.erase_opcode, address))?;
        self.wait_status()?;
        Ok(())
    }

    /// Program one full page at a page-aligned address.
    pub fn write_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        check_aligned(address, self.geometry.page_size)?;
        if data.len() != self.geometry.page_size {
            log::error!("Page write of {} bytes to 0x{:06X}", data.len(), address);
            return Err(Error::PageLength { expected: self.geometry.page_size, actual: data.len() });
        }
        log::trace!("Writing page at 0x{:06X}", address);
        self.write_enable()?;
        let mut tx = frame_header(Command::PageProgram.into(), address).to_vec();
        tx.extend_from_slice(data);
        self.access.write_raw_fast(&tx)?;
        self.wait_status()?;
        Ok(())
    }

    /// Read `length` bytes from `address` using the ReadData instruction.
    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        self.read_with(Command::ReadData, address, length)
    }

    /// Read `length` bytes from `address` using the FastRead instruction.
    pub fn fast_read(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        self.read_with(Command::FastRead, address, length)
    }

    /// Fast-read `length` bytes in up to 128 frames, calling `cb` with the bytes read so far.
    pub fn read_cb<F: FnMut(usize)>(&mut self, address: u32, length: usize, mut cb: F)
        -> Result<Vec<u8>>
    {
        let chunk_size = usize::max(1024, length / 128);
        let mut data = Vec::with_capacity(length);
        cb(0);
        while data.len() < length {
            let size = usize::min(chunk_size, length - data.len());
            let mut chunk = self.fast_read(address + data.len() as u32, size)?;
            data.append(&mut chunk);
            cb(data.len());
        }
        Ok(data)
    }

    /// As `read_cb()`, drawing a progress bar to the terminal.
    pub fn read_progress(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let pb = progress_bar(length as u64, "Reading");
        let result = self.read_cb(address, length, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Erase and write every block of `image` regardless of current contents.
    pub fn program_forced<R: Read>(&mut self, address: u32, image: R) -> Result<ProgramStats> {
        self.program_forced_cb(address, image, |_| {})
    }

    /// As `program_forced()`, calling `cb` with the bytes programmed so far.
    ///
    /// The image is consumed a page at a time. A block is erased whenever a page
    /// starts on an erase boundary, and a final partial page is padded with 0xFF.
    pub fn program_forced_cb<R: Read, F: FnMut(usize)>(
        &mut self, address: u32, mut image: R, mut cb: F,
    ) -> Result<ProgramStats> {
        check_aligned(address, self.geometry.erase_size)?;
        let page_size = self.geometry.page_size;
        let t0 = Instant::now();
        let mut stats = ProgramStats::default();
        let mut page = vec![0u8; page_size];
        loop {
            let n = read_chunk(&mut image, &mut page)?;
            if n == 0 {
                break;
            }
            page[n..].fill(0xFF);
            let addr = self.offset_address(address, stats.bytes, page_size)?;
            if stats.bytes % self.geometry.erase_size == 0 {
                self.erase_block(addr)?;
                stats.blocks += 1;
                stats.erased += 1;
                stats.written += 1;
            }
            self.write_page(addr, &page)?;
            stats.pages_written += 1;
            stats.bytes += n;
            cb(stats.bytes);
            if n < page_size {
                break;
            }
        }
        if stats.bytes == 0 {
            return Err(Error::EmptyImage);
        }
        log_rate(stats.bytes, t0.elapsed());
        Ok(stats)
    }

    /// Program `image` while avoiding unnecessary erases and writes.
    pub fn program_wear_aware<R: Read>(&mut self, address: u32, image: R) -> Result<ProgramStats> {
        self.program_wear_aware_cb(address, image, |_| {})
    }

    /// As `program_wear_aware()`, calling `cb` with the bytes processed so far.
    ///
    /// Each erase block is read back and compared with the image. The block is
    /// erased only if some bit must go from 0 to 1, and each page is written only
    /// if its content differs from what the flash will hold after that decision.
    pub fn program_wear_aware_cb<R: Read, F: FnMut(usize)>(
        &mut self, address: u32, mut image: R, mut cb: F,
    ) -> Result<ProgramStats> {
        check_aligned(address, self.geometry.erase_size)?;
        let erase_size = self.geometry.erase_size;
        let page_size = self.geometry.page_size;
        let t0 = Instant::now();
        let mut stats = ProgramStats::default();
        let mut block = vec![0u8; erase_size];
        loop {
            let n = read_chunk(&mut image, &mut block)?;
            if n == 0 {
                break;
            }
            let file = &block[..n];
            let addr = self.offset_address(address, stats.bytes, n)?;
            let current = self.fast_read(addr, n)?;
            let erase = needs_erase(&current, file);
            let write = needs_write(&current, file, erase);
            log::debug!("Block 0x{:06X}: erase={} write={}", addr, erase, write);
            if erase {
                self.erase_block(addr)?;
                stats.erased += 1;
            }
            if write {
                stats.written += 1;
                for (i, chunk) in file.chunks(page_size).enumerate() {
                    let start = i * page_size;
                    if !needs_write(&current[start..start + chunk.len()], chunk, erase) {
                        continue;
                    }
                    let mut page = chunk.to_vec();
                    page.resize(page_size, 0xFF);
                    self.write_page(addr + start as u32, &page)?;
                    stats.pages_written += 1;
                }
            }
            stats.blocks += 1;
            stats.bytes += n;
            cb(stats.bytes);
            if n < erase_size {
                break;
            }
        }
        if stats.bytes == 0 {
            return Err(Error::EmptyImage);
        }
        log_rate(stats.bytes, t0.elapsed());
        log::info!("{} blocks: {} erased, {} written ({} pages)",
                   stats.blocks, stats.erased, stats.written, stats.pages_written);
        Ok(stats)
    }

    /// Program `data` at `address`, drawing a progress bar to the terminal.
    ///
    /// If `force` is set every block is erased and written, otherwise the
    /// wear-aware loop is used.
    pub fn program_progress(&mut self, address: u32, data: &[u8], force: bool)
        -> Result<ProgramStats>
    {
        check_range(address, data.len())?;
        let pb = progress_bar(data.len() as u64, "Writing");
        let result = if force {
            self.program_forced_cb(address, data, |n| pb.set_position(n as u64))
        } else {
            self.program_wear_aware_cb(address, data, |n| pb.set_position(n as u64))
        };
        pb.finish();
        result
    }

    fn read_with(&mut self, command: Command, address: u32, length: usize) -> Result<Vec<u8>> {
        check_address(address)?;
        let fast = matches!(command, Command::FastRead);
        log::trace!("SPI read: {} bytes from 0x{:06X}, fast={}", length, address, fast);
        let data = self.access.read_raw(&frame_header(command.into(), address), length, fast)?;
        if data.len() != length {
            return Err(anyhow::anyhow!("Read {} bytes, expected {}", data.len(), length).into());
        }
        Ok(data)
    }

    fn command(&mut self, command: Command) -> Result<()> {
        log::trace!("SPI command: {:?}", command);
        self.access.scan(&DrScan::new(&[command.lsb()]))?;
        Ok(())
    }

    /// Read status and compare the masked status byte against `expected`.
    pub fn check_status(&mut self, expected: u8, label: &str) -> Result<bool> {
        let tx = [Command::ReadStatusRegister1.lsb(), 0];
        let expected = [0x00, expected];
        let scan = DrScan::new(&tx).mask(&[0x00, STATUS_MASK]).expect(&expected).label(label);
        let (_, ok) = self.access.scan(&scan)?;
        Ok(ok)
    }

    /// Address of the chunk at `offset`, checking all `len` bytes of it fit in 24 bits.
    fn offset_address(&self, address: u32, offset: usize, len: usize) -> Result<u32> {
        let addr = address as usize + offset;
        check_range(addr as u32, len)?;
        Ok(addr as u32)
    }
}

/// True if writing `file` over `flash` requires setting any 0 bit back to 1.
pub fn needs_erase(flash: &[u8], file: &[u8]) -> bool {
    flash.iter().zip(file).any(|(&f, &d)| f & d != d)
}

/// True if `file` needs programming over `flash`.
///
/// After an erase the flash holds 0xFF, so only non-0xFF bytes need writing.
pub fn needs_write(flash: &[u8], file: &[u8], erasing: bool) -> bool {
    if erasing {
        file.iter().any(|&d| d != 0xFF)
    } else {
        flash.iter().zip(file).any(|(&f, &d)| f != d)
    }
}

/// Fill `buf` from `reader`, stopping early only at end of stream.
///
/// A return value smaller than `buf.len()` means the stream is exhausted.
pub fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Log the transfer rate of a completed upload.
pub fn log_rate(bytes: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { bytes as f64 / (secs * 1024.0 * 1024.0) } else { 0.0 };
    log::info!("{} bytes uploaded in {:.3} s ({:.3} MB/s)", bytes, secs, rate);
}

pub(crate) fn progress_bar(len: u64, msg: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    match ProgressStyle::with_template(DATA_PROGRESS_TPL) {
        Ok(style) => pb.set_style(style.progress_chars(DATA_PROGRESS_CHARS)),
        Err(e) => log::debug!("Progress template rejected: {}", e),
    }
    pb.set_message(msg);
    pb
}

/// Check `address` fits in 24 bits and is a multiple of `align`.
pub fn check_aligned(address: u32, align: usize) -> Result<()> {
    check_address(address)?;
    if address as usize % align != 0 {
        log::error!("Address 0x{:06X} must be a multiple of {} bytes (& 0x{:06X})",
                    address, align, 0xFF_FFFF & !(align as u32 - 1));
        Err(Error::Misaligned { address, align })
    } else {
        Ok(())
    }
}

/// Check `len` bytes starting at `address` fit in the 24-bit address space.
pub fn check_range(address: u32, len: usize) -> Result<()> {
    if address as usize + len > 0x100_0000 {
        log::error!("{} bytes at 0x{:06X} would exceed 24-bit address space", len, address);
        Err(Error::InvalidAddress)
    } else {
        Ok(())
    }
}

fn check_address(address: u32) -> Result<()> {
    if address > 0xFF_FFFF {
        log::error!("Address 0x{:08X} does not fit in 24 bits", address);
        Err(Error::InvalidAddress)
    } else {
        Ok(())
    }
}

fn frame_header(opcode: u8, address: u32) -> [u8; 4] {
    (((opcode as u32) << 24) | (address & 0xFF_FFFF)).to_be_bytes()
}

#[derive(Copy, Clone, Debug)]
#[repr(u8)]
enum Command {
    WriteEnable = 0x06,
    WriteDisable = 0x04,
    ReadStatusRegister1 = 0x05,
    PageProgram = 0x02,
    ReadData = 0x03,
    FastRead = 0x0B,
    SectorErase = 0x20,
    BlockErase1 = 0x52,
    BlockErase2 = 0xD8,
}

impl Command {
    /// Opcode as it must be given to an LSB-first DR scan.
    fn lsb(self) -> u8 {
        (self as u8).reverse_bits()
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> u8 {
        command as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jtag::masked_mismatch;
    use crate::sim::SimFlash;

    /// Connects `Flash` straight to a flash model, reversing bits the way
    /// an LSB-first DR scan does.
    struct Direct {
        flash: SimFlash,
        frames: usize,
        mismatches: usize,
        delays: usize,
    }

    impl Direct {
        fn new() -> Self {
            Direct { flash: SimFlash::new(64 * 1024), frames: 0, mismatches: 0, delays: 0 }
        }
    }

    impl FlashAccess for Direct {
        fn scan(&mut self, scan: &DrScan) -> anyhow::Result<(Vec<u8>, bool)> {
            self.frames += 1;
            let tx: Vec<u8> = scan.data.iter().map(|b| b.reverse_bits()).collect();
            let rx: Vec<u8> = self.flash.exchange(&tx).iter().map(|b| b.reverse_bits()).collect();
            let ok = match scan.expected {
                Some(expected) => !masked_mismatch(&rx, scan.mask, expected),
                None => true,
            };
            if !ok {
                self.mismatches += 1;
            }
            Ok((rx, ok))
        }

        fn write_raw(&mut self, data: &[u8]) -> anyhow::Result<()> {
            self.frames += 1;
            self.flash.exchange(data);
            Ok(())
        }

        fn read_raw(&mut self, header: &[u8], len: usize, fast: bool) -> anyhow::Result<Vec<u8>> {
            self.frames += 1;
            let mut tx = header.to_vec();
            if fast {
                tx.push(0);
            }
            let skip = tx.len();
            tx.resize(skip + len, 0);
            Ok(self.flash.exchange(&tx)[skip..].to_vec())
        }

        fn delay(&mut self, _duration: Duration) {
            self.delays += 1;
        }
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 256) as u8).collect()
    }

    #[test]
    fn test_geometry() {
        assert_eq!(FlashGeometry::default(), FlashGeometry::new(256, 4096).unwrap());
        assert_eq!(FlashGeometry::new(256, 4096).unwrap().erase_opcode(), 0x20);
        assert_eq!(FlashGeometry::new(256, 32768).unwrap().erase_opcode(), 0x52);
        assert_eq!(FlashGeometry::new(256, 65536).unwrap().erase_opcode(), 0xD8);
        assert!(matches!(FlashGeometry::new(256, 8192), Err(Error::InvalidEraseSize(8192))));
        assert!(matches!(FlashGeometry::new(300, 4096), Err(Error::InvalidPageSize(300))));
        assert!(matches!(FlashGeometry::new(8192, 4096), Err(Error::InvalidPageSize(8192))));
    }

    #[test]
    fn test_opcode_bit_order() {
        assert_eq!(Command::WriteEnable.lsb(), 0x60);
        assert_eq!(Command::ReadStatusRegister1.lsb(), 0xA0);
        assert_eq!(Command::WriteDisable.lsb(), 0x20);
        assert_eq!(frame_header(0x20, 0x012345), [0x20, 0x01, 0x23, 0x45]);
    }

    #[test]
    fn test_erase_then_read() {
        let mut access = Direct::new();
        access.flash.mem[4000..9000].fill(0x00);
        let mut flash = Flash::new(&mut access, FlashGeometry::default());
        flash.erase_block(4096).unwrap();
        assert_eq!(flash.read(4096, 4096).unwrap(), vec![0xFF; 4096]);
        assert_eq!(flash.fast_read(4096, 16).unwrap(), vec![0xFF; 16]);
        assert_eq!(flash.read(4000, 96).unwrap(), vec![0x00; 96]);
        assert_eq!(access.flash.erases, vec![4096]);
        assert_eq!(access.mismatches, 0);
        assert!(!access.flash.wel);
    }

    #[test]
    fn test_alignment_guard() {
        let mut access = Direct::new();
        let mut flash = Flash::new(&mut access, FlashGeometry::default());
        assert!(matches!(flash.erase_block(0x100), Err(Error::Misaligned { address: 0x100, .. })));
        assert!(matches!(flash.program_forced(0x800, &[0u8; 16][..]), Err(Error::Misaligned { .. })));
        assert!(matches!(flash.program_wear_aware(0x10, &[0u8; 16][..]), Err(Error::Misaligned { .. })));
        assert!(matches!(flash.write_page(0x80, &[0; 256]), Err(Error::Misaligned { .. })));
        assert!(matches!(flash.write_page(0x100, &[0; 100]), Err(Error::PageLength { .. })));
        assert!(matches!(flash.erase_block(0x0100_0000), Err(Error::InvalidAddress)));
        assert_eq!(access.frames, 0);
    }

    #[test]
    fn test_range_guard() {
        let mut access = Direct::new();
        let mut flash = Flash::new(&mut access, FlashGeometry::default());
        assert!(check_range(0xFF_F000, 4096).is_ok());
        assert!(matches!(check_range(0xFF_F000, 4097), Err(Error::InvalidAddress)));
        assert!(matches!(flash.program_progress(0xFF_F000, &[0u8; 8192], true),
                         Err(Error::InvalidAddress)));
        assert!(matches!(flash.program_progress(0xFF_F000, &[0u8; 8192], false),
                         Err(Error::InvalidAddress)));
        assert_eq!(access.frames, 0);
    }

    #[test]
    fn test_empty_image() {
        let mut access = Direct::new();
        let mut flash = Flash::new(&mut access, FlashGeometry::default());
        assert!(matches!(flash.program_forced(0, &[0u8; 0][..]), Err(Error::EmptyImage)));
        assert_eq!(access.frames, 0);
    }

    #[test]
    fn test_wait_status_polls() {
        let mut access = Direct::new();
        access.flash.busy = 2;
        let mut flash = Flash::new(&mut access, FlashGeometry::default());
        assert!(flash.wait_status().unwrap());
        assert_eq!(access.flash.status_reads, 3);
        assert_eq!(access.delays, 2);
        assert_eq!(access.mismatches, 0);
    }

    #[test]
    fn test_wait_status_exhausted() {
        let mut access = Direct::new();
        access.flash.stuck = true;
        let mut flash = Flash::new(&mut access, FlashGeometry::default());
        flash.set_polling(4, Duration::from_millis(1));
        assert!(!flash.wait_status().unwrap());
        // 4 polls then one diagnostic compare.
        assert_eq!(access.flash.status_reads, 5);
        assert_eq!(access.mismatches, 1);
    }

    #[test]
    fn test_program_forced() {
        let data = image(8192);
        let mut access = Direct::new();
        access.flash.busy_after_op = 1;
        let mut flash = Flash::new(&mut access, FlashGeometry::default());
        let stats = flash.program_forced(0, &data[..]).unwrap();
        assert_eq!(stats.erased, 2);
        assert_eq!(stats.pages_written, 32);
        assert_eq!(stats.bytes, 8192);
        assert_eq!(access.flash.erases, vec![0, 4096]);
        assert_eq!(access.flash.programs.len(), 32);
        assert_eq!(&access.flash.mem[..8192], &data[..]);
        assert_eq!(access.mismatches, 0);
    }

    #[test]
    fn test_program_forced_pads_last_page() {
        let data = image(300);
        let mut access = Direct::new();
        access.flash.mem.fill(0x00);
        let mut flash = Flash::new(&mut access, FlashGeometry::default());
        let mut progress = Vec::new();
        let stats = flash.program_forced_cb(0x1000, &data[..], |n| progress.push(n)).unwrap();
        assert_eq!(progress, vec![256, 300]);
        assert_eq!(stats.pages_written, 2);
        assert_eq!(access.flash.programs, vec![0x1000, 0x1100]);
        assert_eq!(&access.flash.mem[0x1000..0x1000 + 300], &data[..]);
        assert!(access.flash.mem[0x1000 + 300..0x2000].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_wear_aware_idempotent() {
        let data = image(10000);
        let mut access = Direct::new();
        let mut flash = Flash::new(&mut access, FlashGeometry::default());
        let first = flash.program_wear_aware(0x2000, &data[..]).unwrap();
        assert_eq!(first.blocks, 3);
        // The flash starts erased, so nothing needs erasing.
        assert_eq!(first.erased, 0);
        assert_eq!(first.written, 3);

        let second = flash.program_wear_aware(0x2000, &data[..]).unwrap();
        assert_eq!(second, ProgramStats { blocks: 3, bytes: 10000, ..Default::default() });
        assert_eq!(&access.flash.mem[0x2000..0x2000 + 10000], &data[..]);
        assert!(access.flash.erases.is_empty());
    }

    #[test]
    fn test_wear_aware_clear_only() {
        let mut access = Direct::new();
        let mut data = vec![0xF0; 4096];
        access.flash.mem[..4096].fill(0xF0);
        // Clearing bits in page 3 only.
        data[3 * 256 + 10] = 0x30;
        let mut flash = Flash::new(&mut access, FlashGeometry::default());
        let stats = flash.program_wear_aware(0, &data[..]).unwrap();
        assert_eq!(stats.erased, 0);
        assert_eq!(stats.written, 1);
        assert_eq!(stats.pages_written, 1);
        assert_eq!(access.flash.programs, vec![3 * 256]);
        assert_eq!(&access.flash.mem[..4096], &data[..]);
    }

    #[test]
    fn test_wear_aware_erases_when_setting_bits() {
        let mut access = Direct::new();
        access.flash.mem[..4096].fill(0x00);
        let mut data = vec![0xFF; 4096];
        data[600] = 0x12;
        let mut flash = Flash::new(&mut access, FlashGeometry::default());
        let stats = flash.program_wear_aware(0, &data[..]).unwrap();
        assert_eq!(stats.erased, 1);
        // Only the page holding a non-0xFF byte is written after the erase.
        assert_eq!(stats.pages_written, 1);
        assert_eq!(access.flash.programs, vec![512]);
        assert_eq!(&access.flash.mem[..4096], &data[..]);
    }

    #[test]
    fn test_needs_erase_write() {
        assert!(!needs_erase(&[0xFF, 0xF0], &[0x0F, 0xF0]));
        assert!(needs_erase(&[0x0F], &[0xF0]));
        assert!(needs_write(&[0xFF], &[0x12], true));
        assert!(!needs_write(&[0x00], &[0xFF], true));
        assert!(!needs_write(&[0x12, 0x34], &[0x12, 0x34], false));
        assert!(needs_write(&[0x12, 0x34], &[0x12, 0x30], false));
    }

    #[test]
    fn test_read_chunk() {
        struct Trickle<'a>(&'a [u8], bool);
        impl Read for Trickle<'_> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                self.1 = !self.1;
                if self.1 {
                    return Err(ErrorKind::Interrupted.into());
                }
                if self.0.is_empty() || buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = self.0[0];
                self.0 = &self.0[1..];
                Ok(1)
            }
        }
        let mut src = Trickle(&[1, 2, 3, 4, 5], false);
        let mut buf = [0u8; 4];
        assert_eq!(read_chunk(&mut src, &mut buf).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(read_chunk(&mut src, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], 5);
        assert_eq!(read_chunk(&mut src, &mut buf).unwrap(), 0);
    }
}
