//! ECP5 and Nexus vendor JTAG commands, device identification and status
//! register decoding.

use std::fmt;

use bitfield::bitfield;
use tracing::info;

use crate::Error;
use crate::jtag::{TapAccess, TapState};

/// JTAG instruction register opcodes common to the ECP5 and Nexus families.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    IscErase = 0x0E,
    IscDisable = 0x26,
    /// Routes DR shifts through to the SPI flash pins.
    BackgroundSpi = 0x3A,
    LscResetCrc = 0x3B,
    LscReadStatus = 0x3C,
    LscRefresh = 0x79,
    LscBitstreamBurst = 0x7A,
    IscEnable = 0xC6,
    ReadId = 0xE0,
}

/// TCK cycles spent in Run-Test/Idle after a configuration command.
const COMMAND_IDLE_CLOCKS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ecp5,
    Nx,
}

impl Family {
    /// Width of LSC_READ_STATUS data for this family.
    pub fn status_bits(self) -> usize {
        match self {
            Family::Ecp5 => 32,
            Family::Nx => 64,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Part {
    pub name: &'static str,
    pub idcode: u32,
    pub family: Family,
}

const fn ecp5(name: &'static str, idcode: u32) -> Part {
    Part {
        name,
        idcode,
        family: Family::Ecp5,
    }
}

const fn nx(name: &'static str, idcode: u32) -> Part {
    Part {
        name,
        idcode,
        family: Family::Nx,
    }
}

pub static ECP5_PARTS: &[Part] = &[
    ecp5("LFE5U-12", 0x21111043),
    ecp5("LFE5U-25", 0x41111043),
    ecp5("LFE5U-45", 0x41112043),
    ecp5("LFE5U-85", 0x41113043),
    ecp5("LFE5UM-25", 0x01111043),
    ecp5("LFE5UM-45", 0x01112043),
    ecp5("LFE5UM-85", 0x01113043),
    ecp5("LFE5UM5G-25", 0x81111043),
    ecp5("LFE5UM5G-45", 0x81112043),
    ecp5("LFE5UM5G-85", 0x81113043),
];

pub static NX_PARTS: &[Part] = &[
    nx("LIFCL-17", 0x010F0043),
    nx("LIFCL-40-ES", 0x010F1043),
    nx("LIFCL-40", 0x110F1043),
    nx("LFD2NX-40", 0x310F1043),
    nx("LFCPNX-100", 0x010F4043),
];

/// Looks an IDCODE up in the ECP5 and NX tables.
pub fn lookup_part(idcode: u32) -> Option<&'static Part> {
    ECP5_PARTS
        .iter()
        .chain(NX_PARTS)
        .find(|part| part.idcode == idcode)
}

/// Configuration engine error codes reported in the status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BseError {
    None,
    Id,
    IllegalCommand,
    Crc,
    Preamble,
    UserAbort,
    DataOverflow,
    SramSize,
    Authentication,
    AuthenticationSetup,
    EngineTimeout,
    Reserved(u8),
}

impl From<u8> for BseError {
    fn from(code: u8) -> Self {
        match code {
            0b0000 => BseError::None,
            0b0001 => BseError::Id,
            0b0010 => BseError::IllegalCommand,
            0b0011 => BseError::Crc,
            0b0100 => BseError::Preamble,
            0b0101 => BseError::UserAbort,
            0b0110 => BseError::DataOverflow,
            0b0111 => BseError::SramSize,
            0b1000 => BseError::Authentication,
            0b1001 => BseError::AuthenticationSetup,
            0b1010 => BseError::EngineTimeout,
            other => BseError::Reserved(other),
        }
    }
}

impl fmt::Display for BseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BseError::None => write!(f, "no error"),
            BseError::Id => write!(f, "ID error"),
            BseError::IllegalCommand => write!(f, "illegal command"),
            BseError::Crc => write!(f, "CRC error"),
            BseError::Preamble => write!(f, "preamble error"),
            BseError::UserAbort => write!(f, "configuration aborted by the user"),
            BseError::DataOverflow => write!(f, "data overflow"),
            BseError::SramSize => write!(f, "bitstream exceeds the SRAM array"),
            BseError::Authentication => write!(f, "authentication error"),
            BseError::AuthenticationSetup => write!(f, "authentication setup error"),
            BseError::EngineTimeout => write!(f, "bitstream engine timeout"),
            BseError::Reserved(code) => write!(f, "reserved error code {code:#06b}"),
        }
    }
}

bitfield! {
    /// The 32-bit ECP5 configuration status word.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Ecp5Status(u32);
    impl Debug;

    bool;
    pub transparent_mode, set_transparent_mode: 0;

    u8;
    pub config_target, set_config_target: 3, 1;

    bool;
    pub jtag_active, set_jtag_active: 4;
    pub pwd_protection, set_pwd_protection: 5;
    pub decrypt_enable, set_decrypt_enable: 7;
    pub done, set_done: 8;
    pub isc_enable, set_isc_enable: 9;
    pub write_enable, set_write_enable: 10;
    pub read_enable, set_read_enable: 11;
    pub busy, set_busy: 12;
    pub fail, set_fail: 13;
    pub feature_otp, set_feature_otp: 14;
    pub decrypt_only, set_decrypt_only: 15;
    pub pwd_enable, set_pwd_enable: 16;
    pub encrypt_preamble, set_encrypt_preamble: 20;
    pub std_preamble, set_std_preamble: 21;
    pub spim_fail, set_spim_fail: 22;

    u8;
    pub bse_error_code, set_bse_error_code: 25, 23;

    bool;
    pub execution_error, set_execution_error: 26;
    pub id_error, set_id_error: 27;
    pub invalid_command, set_invalid_command: 28;
    pub sed_error, set_sed_error: 29;
    pub bypass_mode, set_bypass_mode: 30;
    pub flow_through_mode, set_flow_through_mode: 31;
}

impl Ecp5Status {
    pub fn bse_error(&self) -> BseError {
        BseError::from(self.bse_error_code())
    }
}

bitfield! {
    /// The 64-bit Nexus configuration status word.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct NxStatus(u64);
    impl Debug;

    bool;
    pub transparent_mode, set_transparent_mode: 0;

    u8;
    pub config_target, set_config_target: 3, 1;

    bool;
    pub jtag_active, set_jtag_active: 4;
    pub pwd_protection, set_pwd_protection: 5;
    pub otp, set_otp: 6;
    pub done, set_done: 8;
    pub isc_enable, set_isc_enable: 9;
    pub write_enable, set_write_enable: 10;
    pub read_enable, set_read_enable: 11;
    pub busy, set_busy: 12;
    pub fail, set_fail: 13;
    pub decrypt_only, set_decrypt_only: 15;
    pub pwd_enable, set_pwd_enable: 16;
    pub pwd_all, set_pwd_all: 17;
    pub cid_enable, set_cid_enable: 18;
    pub encrypt_preamble, set_encrypt_preamble: 21;
    pub std_preamble, set_std_preamble: 22;
    pub spim_fail, set_spim_fail: 23;

    u8;
    pub bse_error_code, set_bse_error_code: 27, 24;

    bool;
    pub execution_error, set_execution_error: 28;
    pub id_error, set_id_error: 29;
    pub invalid_command, set_invalid_command: 30;
    pub wdt_busy, set_wdt_busy: 31;
    pub dry_run_done, set_dry_run_done: 33;

    u8;
    pub previous_bse_error_code, set_previous_bse_error_code: 37, 34;

    bool;
    pub bypass_mode, set_bypass_mode: 38;
    pub flow_through_mode, set_flow_through_mode: 39;
    pub sfdp_timeout, set_sfdp_timeout: 42;
    pub key_destroy_pass, set_key_destroy_pass: 43;
    pub initn, set_initn: 44;
    pub i3c_parity_error_2, set_i3c_parity_error_2: 45;
    pub init_bus_id_error, set_init_bus_id_error: 46;
    pub i3c_parity_error_1, set_i3c_parity_error_1: 47;

    u8;
    pub auth_mode, set_auth_mode: 49, 48;

    bool;
    pub auth_done, set_auth_done: 50;
    pub dry_run_auth_done, set_dry_run_auth_done: 51;
    pub jtag_locked, set_jtag_locked: 52;
    pub sspi_locked, set_sspi_locked: 53;
    pub i2c_locked, set_i2c_locked: 54;
    pub pub_read_lock, set_pub_read_lock: 55;
    pub pub_write_lock, set_pub_write_lock: 56;
    pub fea_read_lock, set_fea_read_lock: 57;
    pub fea_write_lock, set_fea_write_lock: 58;
    pub aes_read_lock, set_aes_read_lock: 59;
    pub aes_write_lock, set_aes_write_lock: 60;
    pub pwd_read_lock, set_pwd_read_lock: 61;
    pub pwd_write_lock, set_pwd_write_lock: 62;
    pub global_lock, set_global_lock: 63;
}

impl NxStatus {
    pub fn bse_error(&self) -> BseError {
        BseError::from(self.bse_error_code())
    }
}

/// A status word read from whichever family is connected.
#[derive(Debug, Clone, Copy)]
pub enum StatusWord {
    Ecp5(Ecp5Status),
    Nx(NxStatus),
}

impl StatusWord {
    /// The register value, zero-extended to 64 bits for the ECP5.
    pub fn raw(&self) -> u64 {
        match self {
            StatusWord::Ecp5(s) => s.0 as u64,
            StatusWord::Nx(s) => s.0,
        }
    }

    pub fn done(&self) -> bool {
        match self {
            StatusWord::Ecp5(s) => s.done(),
            StatusWord::Nx(s) => s.done(),
        }
    }

    pub fn fail(&self) -> bool {
        match self {
            StatusWord::Ecp5(s) => s.fail(),
            StatusWord::Nx(s) => s.fail(),
        }
    }

    pub fn bse_error(&self) -> BseError {
        match self {
            StatusWord::Ecp5(s) => s.bse_error(),
            StatusWord::Nx(s) => s.bse_error(),
        }
    }
}

fn yes_no(v: bool) -> &'static str {
    if v { "yes" } else { "no" }
}

impl fmt::Display for StatusWord {
    /// The verbose field dump; one field per line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusWord::Ecp5(s) => {
                writeln!(f, "ECP5 status register: 0x{:08X}", s.0)?;
                writeln!(f, "  transparent mode:  {}", yes_no(s.transparent_mode()))?;
                writeln!(
                    f,
                    "  config target:     {}",
                    if s.config_target() == 0 { "SRAM" } else { "eFuse" }
                )?;
                writeln!(f, "  JTAG active:       {}", yes_no(s.jtag_active()))?;
                writeln!(f, "  PWD protection:    {}", yes_no(s.pwd_protection()))?;
                writeln!(f, "  decrypt enable:    {}", yes_no(s.decrypt_enable()))?;
                writeln!(f, "  DONE:              {}", yes_no(s.done()))?;
                writeln!(f, "  ISC enable:        {}", yes_no(s.isc_enable()))?;
                writeln!(f, "  write enable:      {}", yes_no(s.write_enable()))?;
                writeln!(f, "  read enable:       {}", yes_no(s.read_enable()))?;
                writeln!(f, "  busy flag:         {}", yes_no(s.busy()))?;
                writeln!(f, "  fail flag:         {}", yes_no(s.fail()))?;
                writeln!(f, "  feature OTP:       {}", yes_no(s.feature_otp()))?;
                writeln!(f, "  decrypt only:      {}", yes_no(s.decrypt_only()))?;
                writeln!(f, "  PWD enable:        {}", yes_no(s.pwd_enable()))?;
                writeln!(f, "  encrypt preamble:  {}", yes_no(s.encrypt_preamble()))?;
                writeln!(f, "  std preamble:      {}", yes_no(s.std_preamble()))?;
                writeln!(f, "  SPIm fail:         {}", yes_no(s.spim_fail()))?;
                writeln!(f, "  BSE error:         {}", s.bse_error())?;
                writeln!(f, "  execution error:   {}", yes_no(s.execution_error()))?;
                writeln!(f, "  ID error:          {}", yes_no(s.id_error()))?;
                writeln!(f, "  invalid command:   {}", yes_no(s.invalid_command()))?;
                writeln!(f, "  SED error:         {}", yes_no(s.sed_error()))?;
                writeln!(f, "  bypass mode:       {}", yes_no(s.bypass_mode()))?;
                write!(f, "  flow-through mode: {}", yes_no(s.flow_through_mode()))
            }
            StatusWord::Nx(s) => {
                writeln!(f, "NX status register: 0x{:016X}", s.0)?;
                writeln!(f, "  transparent mode:  {}", yes_no(s.transparent_mode()))?;
                let target = match s.config_target() {
                    0b000 => "SRAM",
                    0b001 => "eFuse normal",
                    0b010 => "eFuse pseudo",
                    0b011 => "eFuse safe",
                    _ => "invalid",
                };
                writeln!(f, "  config target:     {target}")?;
                writeln!(f, "  JTAG active:       {}", yes_no(s.jtag_active()))?;
                writeln!(f, "  PWD protection:    {}", yes_no(s.pwd_protection()))?;
                writeln!(f, "  OTP:               {}", yes_no(s.otp()))?;
                writeln!(f, "  DONE:              {}", yes_no(s.done()))?;
                writeln!(f, "  ISC enable:        {}", yes_no(s.isc_enable()))?;
                writeln!(f, "  write enable:      {}", yes_no(s.write_enable()))?;
                writeln!(f, "  read enable:       {}", yes_no(s.read_enable()))?;
                writeln!(f, "  busy flag:         {}", yes_no(s.busy()))?;
                writeln!(f, "  fail flag:         {}", yes_no(s.fail()))?;
                writeln!(f, "  decrypt only:      {}", yes_no(s.decrypt_only()))?;
                writeln!(f, "  PWD enable:        {}", yes_no(s.pwd_enable()))?;
                writeln!(f, "  PWD all:           {}", yes_no(s.pwd_all()))?;
                writeln!(f, "  CID enable:        {}", yes_no(s.cid_enable()))?;
                writeln!(f, "  encrypt preamble:  {}", yes_no(s.encrypt_preamble()))?;
                writeln!(f, "  std preamble:      {}", yes_no(s.std_preamble()))?;
                writeln!(f, "  SPIm fail:         {}", yes_no(s.spim_fail()))?;
                writeln!(f, "  BSE error:         {}", s.bse_error())?;
                writeln!(f, "  execution error:   {}", yes_no(s.execution_error()))?;
                writeln!(f, "  ID error:          {}", yes_no(s.id_error()))?;
                writeln!(f, "  invalid command:   {}", yes_no(s.invalid_command()))?;
                writeln!(f, "  WDT busy:          {}", yes_no(s.wdt_busy()))?;
                writeln!(f, "  dry-run DONE:      {}", yes_no(s.dry_run_done()))?;
                writeln!(
                    f,
                    "  previous BSE error: {}",
                    BseError::from(s.previous_bse_error_code())
                )?;
                writeln!(f, "  bypass mode:       {}", yes_no(s.bypass_mode()))?;
                writeln!(f, "  flow-through mode: {}", yes_no(s.flow_through_mode()))?;
                writeln!(f, "  SFDP timeout:      {}", yes_no(s.sfdp_timeout()))?;
                writeln!(f, "  key destroy pass:  {}", yes_no(s.key_destroy_pass()))?;
                writeln!(f, "  INITN:             {}", yes_no(s.initn()))?;
                let auth = match s.auth_mode() {
                    0b01 => "ECDSA",
                    0b10 => "HMAC",
                    _ => "none",
                };
                writeln!(f, "  auth mode:         {auth}")?;
                writeln!(f, "  auth done:         {}", yes_no(s.auth_done()))?;
                writeln!(f, "  JTAG locked:       {}", yes_no(s.jtag_locked()))?;
                writeln!(f, "  SSPI locked:       {}", yes_no(s.sspi_locked()))?;
                writeln!(f, "  I2C/I3C locked:    {}", yes_no(s.i2c_locked()))?;
                write!(f, "  global lock:       {}", yes_no(s.global_lock()))
            }
        }
    }
}

/// The vendor command surface of a connected ECP5/NX device.
pub struct Fpga<'a, T: TapAccess> {
    tap: &'a mut T,
}

impl<'a, T: TapAccess> Fpga<'a, T> {
    pub fn new(tap: &'a mut T) -> Self {
        Fpga { tap }
    }

    fn shift_ir(&mut self, instruction: Instruction) -> Result<(), Error> {
        let mut data = [instruction as u8];
        self.tap.goto(TapState::ShiftIr)?;
        self.tap.shift(&mut data, 8, true)
    }

    /// Reads the raw 32-bit IDCODE.
    pub fn read_idcode(&mut self) -> Result<u32, Error> {
        self.shift_ir(Instruction::ReadId)?;

        let mut data = [0u8; 4];
        self.tap.goto(TapState::ShiftDr)?;
        self.tap.shift(&mut data, 32, true)?;

        // Bytes arrive LSB first, so the word assembles little-endian.
        Ok(u32::from_le_bytes(data))
    }

    /// Reads the IDCODE and resolves it against the device tables. An
    /// unknown IDCODE is fatal: without knowing the family, no vendor
    /// command sequence can be trusted.
    pub fn identify(&mut self) -> Result<&'static Part, Error> {
        let idcode = self.read_idcode()?;
        let part = lookup_part(idcode).ok_or(Error::UnknownIdCode(idcode))?;
        info!("IDCODE: 0x{:08x} ({})", idcode, part.name);
        Ok(part)
    }

    /// Reads the family-sized configuration status word.
    pub fn read_status(&mut self, family: Family) -> Result<StatusWord, Error> {
        self.shift_ir(Instruction::LscReadStatus)?;

        let mut data = [0u8; 8];
        let bits = family.status_bits();
        self.tap.goto(TapState::ShiftDr)?;
        self.tap.shift(&mut data, bits, true)?;

        Ok(match family {
            Family::Ecp5 => {
                let word = u32::from_le_bytes(data[..4].try_into().unwrap());
                StatusWord::Ecp5(Ecp5Status(word))
            }
            Family::Nx => StatusWord::Nx(NxStatus(u64::from_le_bytes(data))),
        })
    }

    /// An IR-only configuration command, followed by the mandatory pause in
    /// Run-Test/Idle.
    pub fn command(&mut self, instruction: Instruction) -> Result<(), Error> {
        self.shift_ir(instruction)?;
        self.tap.goto(TapState::RunTestIdle)?;
        self.tap.idle_clocks(COMMAND_IDLE_CLOCKS)
    }

    /// A configuration command carrying one byte of DR operand.
    pub fn command_u8(&mut self, instruction: Instruction, operand: u8) -> Result<(), Error> {
        self.shift_ir(instruction)?;

        let mut data = [operand];
        self.tap.goto(TapState::ShiftDr)?;
        self.tap.shift(&mut data, 8, true)?;

        self.tap.goto(TapState::RunTestIdle)?;
        self.tap.idle_clocks(COMMAND_IDLE_CLOCKS)
    }

    /// Puts the device into SPI background mode: DR shifts now reach the
    /// flash directly. The trailing move to Run-Test/Idle is required before
    /// the pass-through becomes active.
    pub fn enter_spi_mode(&mut self) -> Result<(), Error> {
        self.shift_ir(Instruction::BackgroundSpi)?;

        // Unlock bytes for the SPI interface.
        let mut data = [0xFE, 0x68];
        self.tap.goto(TapState::ShiftDr)?;
        self.tap.shift(&mut data, 16, true)?;

        self.tap.goto(TapState::RunTestIdle)
    }

    /// Reboots the FPGA from its flash.
    pub fn refresh(&mut self) -> Result<(), Error> {
        self.command(Instruction::LscRefresh)
    }
}
