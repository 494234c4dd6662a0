//! End-to-end programming flows against the simulated TAP.

mod common;

use std::io::Cursor;

use common::MockTap;
use ecpflash::Error;
use ecpflash::flash::{EraseBlock, Flash};
use ecpflash::lattice::{Family, Fpga};
use ecpflash::ops::{self, FlashOptions};

fn options(offset: u32) -> FlashOptions {
    FlashOptions {
        offset,
        erase_block: EraseBlock::Block64K,
        bulk_erase: false,
        skip_erase: false,
        check_only: false,
        skip_verify: false,
        disable_protection: false,
        verbose: false,
    }
}

fn test_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn jedec_id_comes_back_in_wire_order() {
    let mut tap = MockTap::ecp5();
    tap.flash.jedec = [0xEF, 0x40, 0x18];

    Fpga::new(&mut tap).enter_spi_mode().unwrap();

    let mut flash = Flash::new(&mut tap);
    flash.reset().unwrap();
    assert_eq!(flash.read_id().unwrap(), [0xEF, 0x40, 0x18]);
}

#[test]
fn connect_identifies_the_part() {
    let mut tap = MockTap::ecp5();
    let part = ops::connect(&mut tap, false).unwrap();
    assert_eq!(part.name, "LFE5U-25");
    assert_eq!(part.family, Family::Ecp5);
}

#[test]
fn unknown_idcode_refuses_to_continue() {
    let mut tap = MockTap::new(0x12345678, 0);
    let err = ops::connect(&mut tap, false).unwrap_err();
    assert!(matches!(err, Error::UnknownIdCode(0x12345678)));
    assert_eq!(err.exit_code(), 2);

    // Nothing beyond the IDCODE read may have touched the chain.
    assert!(tap.dr_shifts.iter().all(|&(ir, _, _)| ir == 0xE0));
}

#[test]
fn status_width_follows_the_idcode_family() {
    let mut tap = MockTap::ecp5();
    ops::connect(&mut tap, false).unwrap();
    let status_reads: Vec<_> = tap
        .dr_shifts
        .iter()
        .filter(|&&(ir, _, _)| ir == 0x3C)
        .collect();
    assert_eq!(status_reads.len(), 1);
    assert_eq!(status_reads[0].1, 32);

    let mut tap = MockTap::nx();
    ops::connect(&mut tap, false).unwrap();
    let status_reads: Vec<_> = tap
        .dr_shifts
        .iter()
        .filter(|&&(ir, _, _)| ir == 0x3C)
        .collect();
    assert_eq!(status_reads.len(), 1);
    assert_eq!(status_reads[0].1, 64);
}

#[test]
fn programming_splits_on_page_boundaries() {
    let mut tap = MockTap::ecp5();
    let data = test_pattern(400);
    let mut input = Cursor::new(data.clone());

    let mut opts = options(100);
    opts.skip_erase = true;
    ops::flash_mode(&mut tap, &mut input, 400, &opts).unwrap();

    // 400 bytes at offset 100: first page runs to the 256-byte boundary.
    assert_eq!(tap.flash.page_programs, vec![(100, 156), (256, 244)]);
    assert_eq!(&tap.flash.mem[100..500], &data[..]);
}

#[test]
fn erase_only_touches_the_minimal_block_span() {
    let mut tap = MockTap::ecp5();
    ops::erase_mode(&mut tap, 10, &options(70_000)).unwrap();

    // 10 bytes at 70000 fit inside the second 64 kB block.
    assert_eq!(tap.flash.erases, vec![(0xD8, 65_536)]);
    assert!(tap.flash.page_programs.is_empty());
}

#[test]
fn erase_uses_the_selected_block_size() {
    let mut tap = MockTap::ecp5();
    let mut opts = options(0);
    opts.erase_block = EraseBlock::Sector4K;
    ops::erase_mode(&mut tap, 9000, &opts).unwrap();

    assert_eq!(tap.flash.erases, vec![(0x20, 0), (0x20, 4096), (0x20, 8192)]);
}

#[test]
fn bulk_erase_issues_a_chip_erase() {
    let mut tap = MockTap::ecp5();
    let mut opts = options(0);
    opts.bulk_erase = true;
    ops::erase_mode(&mut tap, 0, &opts).unwrap();

    assert_eq!(tap.flash.chip_erases, 1);
    assert!(tap.flash.erases.is_empty());
}

#[test]
fn program_erase_program_verify_round_trip() {
    let mut tap = MockTap::ecp5();
    // Stale contents to be erased.
    tap.flash.mem[..65536].fill(0x55);

    let data = test_pattern(20_000);
    let mut input = Cursor::new(data.clone());
    ops::flash_mode(&mut tap, &mut input, data.len() as u64, &options(0)).unwrap();

    assert_eq!(tap.flash.erases, vec![(0xD8, 0)]);
    assert_eq!(&tap.flash.mem[..20_000], &data[..]);
    // Erased tail stays blank.
    assert_eq!(tap.flash.mem[20_000], 0xFF);
}

#[test]
fn verify_stops_at_the_first_mismatch() {
    let mut tap = MockTap::ecp5();
    let data = test_pattern(8192);
    tap.flash.mem[..8192].copy_from_slice(&data);
    tap.flash.mem[0x1000] ^= 0xFF;

    let mut input = Cursor::new(data);
    let mut opts = options(0);
    opts.check_only = true;
    let err = ops::flash_mode(&mut tap, &mut input, 8192, &opts).unwrap_err();

    assert!(matches!(err, Error::VerifyMismatch { address: 0x1000 }));
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn check_mode_passes_on_identical_contents() {
    let mut tap = MockTap::ecp5();
    let data = test_pattern(8192);
    tap.flash.mem[4096..4096 + 8192].copy_from_slice(&data);

    let mut input = Cursor::new(data);
    let mut opts = options(4096);
    opts.check_only = true;
    ops::flash_mode(&mut tap, &mut input, 8192, &opts).unwrap();
    assert!(tap.flash.page_programs.is_empty());
}

#[test]
fn streaming_read_is_gapless_across_chunks() {
    let mut tap = MockTap::ecp5();
    for (i, b) in tap.flash.mem.iter_mut().enumerate() {
        *b = (i % 241) as u8;
    }

    let mut out = Vec::new();
    ops::read_flash(&mut tap, &mut out, 100, 10_000).unwrap();

    assert_eq!(out.len(), 10_000);
    for (i, &b) in out.iter().enumerate() {
        assert_eq!(b, ((100 + i) % 241) as u8, "at offset {i}");
    }
}

#[test]
fn busy_wait_needs_three_consecutive_idle_polls() {
    let mut tap = MockTap::ecp5();
    Fpga::new(&mut tap).enter_spi_mode().unwrap();

    tap.flash.busy_polls = 5;
    let mut flash = Flash::new(&mut tap);
    flash.wait().unwrap();

    // Five busy polls, then three clean ones.
    assert_eq!(tap.flash.status_polls, 8);
}

#[test]
fn sram_burst_stays_in_shift_dr_until_the_last_chunk() {
    let mut tap = MockTap::ecp5();
    let part = ops::connect(&mut tap, false).unwrap();

    let bitstream = test_pattern(40_000); // 16 KiB + 16 KiB + tail
    let mut input = Cursor::new(bitstream);
    ops::program_sram(&mut tap, part, &mut input).unwrap();

    let burst: Vec<_> = tap
        .dr_shifts
        .iter()
        .filter(|&&(ir, _, _)| ir == 0x7A)
        .collect();
    assert_eq!(burst.len(), 3);
    assert_eq!(burst[0].1, 16 * 1024 * 8);
    assert!(!burst[0].2);
    assert!(!burst[1].2);
    assert_eq!(burst[2].1, (40_000 - 32 * 1024) * 8);
    assert!(burst[2].2, "the final chunk must leave Shift-DR");
}
