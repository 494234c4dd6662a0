//! The programming flows: test, SRAM configuration, flash program/verify,
//! flash read and erase-only.
//!
//! Everything here is generic over [`TapAccess`] so the flows can run against
//! a simulated TAP in the integration tests.

use std::io::{Read, Seek, SeekFrom, Write};
use std::thread;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use crate::Error;
use crate::flash::{self, EraseBlock, Flash, READ_CHUNK};
use crate::jtag::{TapAccess, TapState};
use crate::lattice::{Fpga, Instruction, Part};

/// Bitstream chunk used by the SRAM burst.
const SRAM_CHUNK: usize = 16 * 1024;

/// Flash-mode knobs collected from the command line.
#[derive(Debug, Clone)]
pub struct FlashOptions {
    pub offset: u32,
    pub erase_block: EraseBlock,
    pub bulk_erase: bool,
    pub skip_erase: bool,
    /// Verify against the input without writing.
    pub check_only: bool,
    pub skip_verify: bool,
    pub disable_protection: bool,
    pub verbose: bool,
}

/// Reads the IDCODE and the configuration status. This is the first thing
/// every mode does; an IDCODE outside the device tables aborts here, before
/// any vendor sequence touches the part.
pub fn connect<T: TapAccess>(tap: &mut T, verbose: bool) -> Result<&'static Part, Error> {
    let mut fpga = Fpga::new(tap);
    let part = fpga.identify()?;

    let status = fpga.read_status(part.family)?;
    info!("status register: 0x{:08x}", status.raw());
    if verbose {
        eprintln!("{status}");
    }

    Ok(part)
}

/// Reads `buf.len()` bytes unless the stream ends first.
fn read_chunk<R: Read>(input: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = input.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn byte_progress(msg: &'static str, len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::with_template(
            "{msg:>12} [{wide_bar}] {bytes:>10}/{total_bytes} ({eta})",
        )
        .unwrap()
        .progress_chars("##-"),
    );
    bar.set_message(msg);
    bar
}

/// Test / flash-ID mode: bounce the configuration engine to release the SPI
/// pins, then interrogate the flash.
pub fn test_mode<T: TapAccess>(tap: &mut T) -> Result<(), Error> {
    {
        let mut fpga = Fpga::new(tap);
        fpga.command_u8(Instruction::IscEnable, 0)?;
        thread::sleep(Duration::from_millis(10));
        fpga.command_u8(Instruction::IscErase, 0)?;
        thread::sleep(Duration::from_millis(10));
        fpga.command(Instruction::IscDisable)?;

        fpga.enter_spi_mode()?;
    }

    let mut flash = Flash::new(tap);
    flash.reset()?;

    let id = flash.read_id()?;
    info!("flash ID: 0x{:02X} 0x{:02X} 0x{:02X}", id[0], id[1], id[2]);

    let sr1 = flash.read_status1()?;
    let sr2 = flash.read_status2()?;
    info!("flash SR1: 0x{:02X} ({:?})", sr1.bits(), sr1);
    info!("flash SR2: 0x{:02X}", sr2);

    Ok(())
}

/// Streams a bitstream straight into the configuration SRAM.
pub fn program_sram<T: TapAccess, R: Read>(
    tap: &mut T,
    part: &Part,
    input: &mut R,
) -> Result<(), Error> {
    info!("reset..");
    {
        let mut fpga = Fpga::new(tap);
        fpga.command_u8(Instruction::IscEnable, 0)?;
        fpga.command_u8(Instruction::IscErase, 0)?;
        fpga.command_u8(Instruction::LscResetCrc, 0)?;

        let status = fpga.read_status(part.family)?;
        debug!("status before burst: 0x{:08x}", status.raw());

        fpga.command(Instruction::LscBitstreamBurst)?;
    }

    info!("programming..");

    // The burst is one long DR scan: the TAP stays in Shift-DR between
    // chunks and only the very last bit may raise TMS. One chunk of
    // read-ahead tells us which chunk is the last.
    let mut in_shift = false;
    let mut pending: Vec<u8> = Vec::new();
    let mut buffer = vec![0u8; SRAM_CHUNK];
    loop {
        let n = read_chunk(input, &mut buffer)?;
        if n == 0 {
            break;
        }
        if !pending.is_empty() {
            shift_bitstream_chunk(tap, &mut pending, false, &mut in_shift)?;
        }
        pending.clear();
        pending.extend_from_slice(&buffer[..n]);
    }
    if !pending.is_empty() {
        shift_bitstream_chunk(tap, &mut pending, true, &mut in_shift)?;
    }

    let mut fpga = Fpga::new(tap);
    fpga.command(Instruction::IscDisable)?;

    let status = fpga.read_status(part.family)?;
    info!("status register: 0x{:08x}", status.raw());
    if status.fail() {
        info!("configuration engine reports failure: {}", status.bse_error());
    }

    Ok(())
}

fn shift_bitstream_chunk<T: TapAccess>(
    tap: &mut T,
    data: &mut [u8],
    last: bool,
    in_shift: &mut bool,
) -> Result<(), Error> {
    // The bitstream is consumed MSB first, the scan chain shifts LSB first.
    for byte in data.iter_mut() {
        *byte = byte.reverse_bits();
    }

    if !*in_shift {
        tap.goto(TapState::ShiftDr)?;
        *in_shift = true;
    }

    let bits = data.len() * 8;
    tap.shift(data, bits, last)
}

/// Reset-release, SPI background mode, flash reset and JEDEC ID. Common
/// prologue of every flash-touching mode.
fn prepare_flash_access<T: TapAccess>(tap: &mut T) -> Result<(), Error> {
    info!("reset..");
    {
        let mut fpga = Fpga::new(tap);
        fpga.command_u8(Instruction::IscEnable, 0)?;
        fpga.command_u8(Instruction::IscErase, 0)?;
        fpga.command_u8(Instruction::IscDisable, 0)?;

        fpga.enter_spi_mode()?;
    }

    let mut flash = Flash::new(tap);
    flash.reset()?;

    let id = flash.read_id()?;
    info!("flash ID: 0x{:02X} 0x{:02X} 0x{:02X}", id[0], id[1], id[2]);

    Ok(())
}

/// The default mode: erase, program and verify the flash, with the `-b`,
/// `-n`, `-c`, `-X` and `-p` variations folded in. `size` is the input
/// length, known up front so the erase span can be computed.
pub fn flash_mode<T: TapAccess, F: Read + Seek>(
    tap: &mut T,
    input: &mut F,
    size: u64,
    options: &FlashOptions,
) -> Result<(), Error> {
    prepare_flash_access(tap)?;

    if !options.check_only {
        let mut flash = Flash::new(tap);

        if options.disable_protection {
            info!("disabling write protection..");
            flash.write_enable()?;
            flash.disable_protection()?;
        }

        if !options.skip_erase {
            if options.bulk_erase {
                info!("bulk erase..");
                flash.write_enable()?;
                flash.chip_erase()?;
                flash.wait()?;
            } else {
                erase_blocks(&mut flash, size, options)?;
            }
        }

        info!("programming..");
        let bar = byte_progress("programming", size);
        let mut page = [0u8; flash::PAGE_SIZE];
        for (addr, len) in flash::page_splits(options.offset, size as usize) {
            input.read_exact(&mut page[..len])?;

            flash.write_enable()?;
            flash.program_page(addr, &page[..len])?;
            flash.wait()?;

            bar.inc(len as u64);
        }
        bar.finish();

        // Rewind for the verify pass.
        input.seek(SeekFrom::Start(0))?;
    }

    if !options.skip_verify {
        verify(tap, input, size, options.offset)?;
    }

    Ok(())
}

/// Erase-only mode: erase the blocks a write of `size` bytes would touch,
/// program nothing.
pub fn erase_mode<T: TapAccess>(
    tap: &mut T,
    size: u64,
    options: &FlashOptions,
) -> Result<(), Error> {
    prepare_flash_access(tap)?;

    let mut flash = Flash::new(tap);

    if options.disable_protection {
        info!("disabling write protection..");
        flash.write_enable()?;
        flash.disable_protection()?;
    }

    if !options.skip_erase {
        if options.bulk_erase {
            info!("bulk erase..");
            flash.write_enable()?;
            flash.chip_erase()?;
            flash.wait()?;
        } else {
            erase_blocks(&mut flash, size, options)?;
        }
    }

    Ok(())
}

fn erase_blocks<T: TapAccess>(
    flash: &mut Flash<'_, T>,
    size: u64,
    options: &FlashOptions,
) -> Result<(), Error> {
    let block = options.erase_block;
    let span = flash::erase_span(options.offset, size as usize, block);
    let blocks = (span.end - span.start) / block.size();

    info!(
        "erasing 0x{:06X}..0x{:06X} in {} kB blocks..",
        span.start,
        span.end,
        block.size() / 1024
    );

    let bar = ProgressBar::new(blocks as u64);
    bar.set_style(
        ProgressStyle::with_template("{msg:>12} [{wide_bar}] {pos}/{len} blocks")
            .unwrap()
            .progress_chars("##-"),
    );
    bar.set_message("erasing");

    for addr in span.step_by(block.size() as usize) {
        flash.write_enable()?;
        flash.erase_block(block, addr)?;
        if options.verbose {
            let sr1 = flash.read_status1()?;
            debug!("SR1 after erase at 0x{addr:06X}: 0x{:02X}", sr1.bits());
        }
        flash.wait()?;
        bar.inc(1);
    }
    bar.finish();

    Ok(())
}

fn verify<T: TapAccess, F: Read>(
    tap: &mut T,
    input: &mut F,
    size: u64,
    offset: u32,
) -> Result<(), Error> {
    info!("verifying..");

    let mut flash = Flash::new(tap);
    flash.start_read(offset)?;

    let bar = byte_progress("verifying", size);
    let mut file_buf = [0u8; READ_CHUNK];
    let mut flash_buf = [0u8; READ_CHUNK];
    let mut position = 0u32;
    loop {
        let n = read_chunk(input, &mut file_buf)?;
        if n == 0 {
            break;
        }

        flash.continue_read(&mut flash_buf[..n])?;

        if let Some(i) = (0..n).find(|&i| file_buf[i] != flash_buf[i]) {
            bar.abandon();
            return Err(Error::VerifyMismatch {
                address: offset + position + i as u32,
            });
        }

        position += n as u32;
        bar.inc(n as u64);
    }
    bar.finish();

    info!("verify ok");
    Ok(())
}

/// Read mode: stream `size` bytes starting at `offset` to the output.
pub fn read_flash<T: TapAccess, W: Write>(
    tap: &mut T,
    output: &mut W,
    offset: u32,
    size: u64,
) -> Result<(), Error> {
    prepare_flash_access(tap)?;

    info!("reading..");
    let mut flash = Flash::new(tap);
    flash.start_read(offset)?;

    let bar = byte_progress("reading", size);
    let mut buf = [0u8; READ_CHUNK];
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(READ_CHUNK as u64) as usize;
        flash.continue_read(&mut buf[..n])?;
        output.write_all(&buf[..n])?;
        remaining -= n as u64;
        bar.inc(n as u64);
    }
    bar.finish();

    Ok(())
}

/// Post-mode `-a`: reload the FPGA from its flash.
pub fn refresh<T: TapAccess>(tap: &mut T) -> Result<(), Error> {
    info!("rebooting FPGA from flash..");
    Fpga::new(tap).refresh()
}
