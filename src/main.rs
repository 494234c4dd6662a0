use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::process::exit;
use std::str::FromStr;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ecpflash::flash::EraseBlock;
use ecpflash::ops::{self, FlashOptions};
use ecpflash::{DeviceSelector, Error, Interface, JtagPort, Mpsse};

/// 24-bit SPI addressing caps the reachable flash at 16 MiB.
const MAX_FLASH_ADDRESS: u64 = 16 * 1024 * 1024;

const DEFAULT_READ_SIZE: u64 = 256 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "ecpflash",
    version,
    about = "Programming tool for Lattice ECP5/NX FPGAs with FTDI-based JTAG probes",
    after_help = "\
Exit status:
  0  success
  1  invalid options, or reading/writing a file failed
  2  communication with the hardware failed
  3  flash verification failed"
)]
struct Cli {
    /// USB device selector: d:<bus>/<addr>, i:<vid>:<pid>[:<index>] or
    /// s:<vid>:<pid>:<serial> [default: first FTDI 0x6010/0x6014 device]
    #[arg(short = 'd', value_name = "SELECTOR")]
    device: Option<String>,

    /// FTDI interface to connect to
    #[arg(short = 'I', value_name = "A|B|C|D", default_value = "A", value_parser = parse_interface)]
    interface: Interface,

    /// Start address for read/write; 'k' and 'M' suffixes and 0x hex accepted
    #[arg(short = 'o', value_name = "OFFSET", value_parser = parse_size, default_value = "0")]
    offset: u64,

    /// Divider for the JTAG clock, TCK = 6 MHz / divider
    #[arg(short = 'k', value_name = "DIVIDER", default_value_t = 1)]
    clock_divider: u32,

    /// Slow clock, equivalent to -k 30
    #[arg(short = 's')]
    slow: bool,

    /// Verbose status decoding
    #[arg(short = 'v')]
    verbose: bool,

    /// Erase block size in kilobytes
    #[arg(short = 'i', value_name = "4|32|64", default_value = "64", value_parser = parse_erase_block)]
    erase_block: EraseBlock,

    /// Reboot the FPGA from its flash after the operation finishes
    #[arg(short = 'a')]
    refresh: bool,

    /// Read the first 256 kB of flash into <FILE>
    #[arg(short = 'r')]
    read: bool,

    /// Read the given number of bytes of flash into <FILE>
    #[arg(short = 'R', value_name = "SIZE", value_parser = parse_size)]
    read_size: Option<u64>,

    /// Do not write the flash, only verify ("check")
    #[arg(short = 'c')]
    check: bool,

    /// Program the configuration SRAM instead of the flash
    #[arg(short = 'S')]
    sram: bool,

    /// Just read the FPGA and flash IDs; takes no file
    #[arg(short = 't')]
    test: bool,

    /// Write the flash but skip the verification pass
    #[arg(short = 'X')]
    no_verify: bool,

    /// Bulk-erase the entire flash before writing
    #[arg(short = 'b')]
    bulk_erase: bool,

    /// Erase the flash as if writing the given number of bytes, program nothing
    #[arg(short = 'e', value_name = "SIZE", value_parser = parse_size)]
    erase_size: Option<u64>,

    /// Do not erase the flash before writing
    #[arg(short = 'n')]
    no_erase: bool,

    /// Disable flash write protection before erasing or writing
    #[arg(short = 'p')]
    unprotect: bool,

    /// Bitstream to write, or the output file in read mode; '-' means
    /// stdin/stdout
    #[arg(value_name = "FILE")]
    filename: Option<String>,
}

fn parse_size(s: &str) -> Result<u64, String> {
    let (digits, multiplier) = if let Some(d) = s.strip_suffix('k') {
        (d, 1024)
    } else if let Some(d) = s.strip_suffix('M') {
        (d, 1024 * 1024)
    } else {
        (s, 1)
    };

    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        digits.parse()
    };

    value
        .map_err(|_| format!("`{s}` is not a valid size"))?
        .checked_mul(multiplier)
        .ok_or_else(|| format!("`{s}` is out of range"))
}

fn parse_interface(s: &str) -> Result<Interface, String> {
    match s {
        "A" => Ok(Interface::A),
        "B" => Ok(Interface::B),
        "C" => Ok(Interface::C),
        "D" => Ok(Interface::D),
        _ => Err(format!(
            "`{s}` is not a valid interface (must be A, B, C or D)"
        )),
    }
}

fn parse_erase_block(s: &str) -> Result<EraseBlock, String> {
    match s {
        "4" => Ok(EraseBlock::Sector4K),
        "32" => Ok(EraseBlock::Block32K),
        "64" => Ok(EraseBlock::Block64K),
        _ => Err(format!(
            "`{s}` is not a valid erase block size (must be 4, 32 or 64)"
        )),
    }
}

/// The flag-combination rules that clap can't express directly.
fn validate(cli: &Cli) -> Result<(), String> {
    let read_mode = cli.read || cli.read_size.is_some();
    let erase_mode = cli.erase_size.is_some();

    let exclusive = [read_mode, erase_mode, cli.check, cli.sram, cli.test];
    if exclusive.iter().filter(|&&m| m).count() > 1 {
        return Err(
            "options `-r'/`-R', `-e', `-c', `-S' and `-t' are mutually exclusive".to_string(),
        );
    }

    if cli.bulk_erase && cli.no_erase {
        return Err("options `-b' and `-n' are mutually exclusive".to_string());
    }

    let not_programming = read_mode || cli.check || cli.sram || cli.test;
    if cli.unprotect && not_programming {
        return Err("option `-p' is only valid in programming mode".to_string());
    }
    if cli.bulk_erase && not_programming {
        return Err("option `-b' is only valid in programming mode".to_string());
    }
    if cli.no_erase && not_programming {
        return Err("option `-n' is only valid in programming mode".to_string());
    }

    if cli.offset != 0 && cli.sram {
        return Err("option `-o' is not supported in SRAM mode".to_string());
    }
    if cli.offset != 0 && cli.test {
        return Err("option `-o' is not supported in test mode".to_string());
    }
    if cli.offset >= MAX_FLASH_ADDRESS {
        return Err("offset is beyond the 16 MiB flash address space".to_string());
    }

    if !(1..=65536).contains(&cli.clock_divider) {
        return Err("clock divider must be in the range 1-65536".to_string());
    }

    if cli.test && cli.filename.is_some() {
        return Err("test mode does not take a file name".to_string());
    }
    let needs_no_file = cli.test || erase_mode || cli.bulk_erase || cli.unprotect;
    if cli.filename.is_none() && !needs_no_file {
        return Err("missing file name".to_string());
    }

    Ok(())
}

/// Opens the programming input so that its size is known and it can be read
/// twice (program, then verify). Non-seekable inputs, stdin included, are
/// drained into an unlinked temporary file first.
fn open_input(filename: Option<&str>) -> io::Result<(File, u64)> {
    match filename {
        // `-b`/`-p` without a file: nothing to program or verify.
        None => Ok((tempfile::tempfile()?, 0)),
        Some("-") => drain_to_tempfile(io::stdin().lock()),
        Some(path) => {
            let mut file = File::open(path)?;
            match file.seek(SeekFrom::End(0)) {
                Ok(size) => {
                    file.seek(SeekFrom::Start(0))?;
                    Ok((file, size))
                }
                // A named pipe or similar; fall back to buffering.
                Err(_) => drain_to_tempfile(file),
            }
        }
    }
}

fn drain_to_tempfile<R: Read>(mut input: R) -> io::Result<(File, u64)> {
    let mut tmp = tempfile::tempfile()?;
    let size = io::copy(&mut input, &mut tmp)?;
    tmp.seek(SeekFrom::Start(0))?;
    Ok((tmp, size))
}

fn run(cli: Cli) -> Result<(), Error> {
    let read_mode = cli.read || cli.read_size.is_some();
    let read_size = cli.read_size.unwrap_or(DEFAULT_READ_SIZE);
    let filename = cli.filename.as_deref();

    let selector = cli
        .device
        .as_deref()
        .map(DeviceSelector::from_str)
        .transpose()?;
    let divider = if cli.slow { 30 } else { cli.clock_divider };

    // Touch the files before the hardware so a bad path fails cheaply.
    let mut output: Option<Box<dyn Write>> = if read_mode {
        Some(match filename {
            Some("-") => Box::new(io::stdout()),
            Some(path) => Box::new(File::create(path)?),
            None => unreachable!("validated above"),
        })
    } else {
        None
    };

    let mut sram_input: Option<Box<dyn Read>> = if cli.sram {
        Some(match filename {
            Some("-") => Box::new(io::stdin()),
            Some(path) => Box::new(File::open(path)?),
            None => unreachable!("validated above"),
        })
    } else {
        None
    };

    let flash_program = !read_mode && !cli.sram && !cli.test && cli.erase_size.is_none();
    let mut flash_input: Option<(File, u64)> = if flash_program {
        Some(open_input(filename)?)
    } else {
        None
    };

    info!("init..");
    let mpsse = Mpsse::open(selector.as_ref(), cli.interface, divider)?;
    let mut port = JtagPort::new(mpsse)?;

    let part = ops::connect(&mut port, cli.verbose)?;

    let options = FlashOptions {
        offset: cli.offset as u32,
        erase_block: cli.erase_block,
        bulk_erase: cli.bulk_erase,
        skip_erase: cli.no_erase,
        check_only: cli.check,
        skip_verify: cli.no_verify,
        disable_protection: cli.unprotect,
        verbose: cli.verbose,
    };

    if cli.test {
        ops::test_mode(&mut port)?;
    } else if cli.sram {
        ops::program_sram(&mut port, part, sram_input.as_mut().unwrap())?;
    } else if read_mode {
        ops::read_flash(
            &mut port,
            output.as_mut().unwrap(),
            cli.offset as u32,
            read_size,
        )?;
    } else if let Some(erase_size) = cli.erase_size {
        ops::erase_mode(&mut port, erase_size, &options)?;
    } else {
        let (file, size) = flash_input.as_mut().unwrap();
        ops::flash_mode(&mut port, file, *size, &options)?;
    }

    if cli.refresh {
        ops::refresh(&mut port)?;
    }

    info!("done");
    Ok(())
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            exit(code);
        }
    };

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .init();

    if let Err(message) = validate(&cli) {
        eprintln!("ecpflash: {message}");
        eprintln!("Try `ecpflash --help' for more information.");
        exit(1);
    }

    if let Err(e) = run(cli) {
        eprintln!("ecpflash: {e}");
        exit(e.exit_code());
    }
}
