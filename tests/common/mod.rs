//! A simulated TAP with an ECP5/NX front half and a Winbond-style SPI NOR
//! flash behind the background-SPI pass-through. The programming flows run
//! against this exactly as they would against hardware.

use ecpflash::Error;
use ecpflash::jtag::{TapAccess, TapState};

const FLASH_SIZE: usize = 256 * 1024;

const IR_BACKGROUND_SPI: u8 = 0x3A;
const IR_READ_STATUS: u8 = 0x3C;
const IR_READ_ID: u8 = 0xE0;

pub struct MockTap {
    state: TapState,
    ir: u8,
    idcode: u32,
    status: u64,

    /// Set after the IR 0x3A + unlock-word dance; DR shifts then reach the
    /// flash model.
    spi_ready: bool,
    awaiting_unlock: bool,
    cs_low: bool,

    /// Every DR shift as (active IR, bit count, advance).
    pub dr_shifts: Vec<(u8, usize, bool)>,

    pub flash: FlashModel,
}

impl MockTap {
    pub fn new(idcode: u32, status: u64) -> Self {
        MockTap {
            state: TapState::TestLogicReset,
            ir: 0xFF,
            idcode,
            status,
            spi_ready: false,
            awaiting_unlock: false,
            cs_low: false,
            dr_shifts: Vec::new(),
            flash: FlashModel::new(),
        }
    }

    /// An LFE5U-25 with DONE set.
    pub fn ecp5() -> Self {
        Self::new(0x41111043, 1 << 8)
    }

    /// A LIFCL-40 with DONE set.
    pub fn nx() -> Self {
        Self::new(0x110F1043, 1 << 8)
    }

    fn release_cs(&mut self) {
        if self.cs_low {
            self.cs_low = false;
            self.flash.end_transaction();
        }
    }
}

impl TapAccess for MockTap {
    fn current_state(&self) -> TapState {
        self.state
    }

    fn goto(&mut self, target: TapState) -> Result<(), Error> {
        // Leaving Shift-DR by any route deasserts chip-select.
        if self.state == TapState::ShiftDr && target != TapState::ShiftDr {
            self.release_cs();
        }
        self.state = target;
        Ok(())
    }

    fn shift(&mut self, data: &mut [u8], bits: usize, advance: bool) -> Result<(), Error> {
        match self.state {
            TapState::ShiftIr => {
                assert_eq!(bits, 8, "instruction register is 8 bits wide");
                self.ir = data[0];
                self.spi_ready = false;
                self.awaiting_unlock = self.ir == IR_BACKGROUND_SPI;
                data[0] = 0;
            }
            TapState::ShiftDr => {
                self.dr_shifts.push((self.ir, bits, advance));

                if self.awaiting_unlock {
                    assert_eq!(bits, 16, "SPI unlock word is 16 bits");
                    assert_eq!(&data[..2], &[0xFE, 0x68], "bad SPI unlock word");
                    self.awaiting_unlock = false;
                    self.spi_ready = true;
                    data[..2].fill(0);
                } else if self.spi_ready {
                    self.cs_low = true;
                    // Wire bytes are bit-reversed by the bridge; undo that to
                    // feed the flash model MSB-first bytes.
                    for slot in data[..bits / 8].iter_mut() {
                        let reply = self.flash.feed(slot.reverse_bits());
                        *slot = reply.reverse_bits();
                    }
                } else {
                    let reply: Vec<u8> = match self.ir {
                        IR_READ_ID => self.idcode.to_le_bytes().to_vec(),
                        IR_READ_STATUS => self.status.to_le_bytes().to_vec(),
                        _ => Vec::new(),
                    };
                    for (i, slot) in data[..bits.div_ceil(8)].iter_mut().enumerate() {
                        *slot = reply.get(i).copied().unwrap_or(0);
                    }
                }

                if advance {
                    self.release_cs();
                }
            }
            other => panic!("shift in non-shift state {other:?}"),
        }

        if advance {
            self.state = self.state.step(true);
        }
        Ok(())
    }

    fn idle_clocks(&mut self, _clocks: usize) -> Result<(), Error> {
        Ok(())
    }
}

struct Transaction {
    op: u8,
    args: Vec<u8>,
    replies: usize,
}

pub struct FlashModel {
    pub mem: Vec<u8>,
    pub jedec: [u8; 3],
    pub sr1: u8,
    wel: bool,

    /// RSR1 transactions left that should still report busy.
    pub busy_polls: usize,
    /// Total RSR1 transactions observed.
    pub status_polls: usize,

    pub page_programs: Vec<(u32, usize)>,
    /// Erase commands as (opcode, address).
    pub erases: Vec<(u8, u32)>,
    pub chip_erases: usize,

    current: Option<Transaction>,
}

fn address(args: &[u8]) -> u32 {
    ((args[0] as u32) << 16) | ((args[1] as u32) << 8) | args[2] as u32
}

impl FlashModel {
    fn new() -> Self {
        FlashModel {
            mem: vec![0xFF; FLASH_SIZE],
            jedec: [0xEF, 0x40, 0x18],
            sr1: 0,
            wel: false,
            busy_polls: 0,
            status_polls: 0,
            page_programs: Vec::new(),
            erases: Vec::new(),
            chip_erases: 0,
            current: None,
        }
    }

    /// One SPI clock-byte while chip-select is low.
    fn feed(&mut self, byte: u8) -> u8 {
        let Some(xact) = self.current.as_mut() else {
            if byte == 0x05 {
                self.status_polls += 1;
            }
            self.current = Some(Transaction {
                op: byte,
                args: Vec::new(),
                replies: 0,
            });
            return 0;
        };

        xact.replies += 1;
        let pos = xact.replies;
        match xact.op {
            // RSR1: busy for a configurable number of polls.
            0x05 => {
                if self.busy_polls > 0 {
                    self.busy_polls -= 1;
                    self.sr1 | 0x01
                } else {
                    self.sr1 & !0x01
                }
            }
            // RSR2
            0x35 => 0x00,
            0x9F => self.jedec.get(pos - 1).copied().unwrap_or(0),
            // Streaming read: three address bytes, then data until CS rises.
            0x03 => {
                if pos <= 3 {
                    xact.args.push(byte);
                    0
                } else {
                    let addr = address(&xact.args) as usize + (pos - 4);
                    self.mem.get(addr).copied().unwrap_or(0xFF)
                }
            }
            // Commands that act when chip-select deasserts.
            0x01 | 0x02 | 0x20 | 0x52 | 0xD8 => {
                xact.args.push(byte);
                0
            }
            _ => 0,
        }
    }

    fn end_transaction(&mut self) {
        let Some(xact) = self.current.take() else {
            return;
        };
        match xact.op {
            0x06 => self.wel = true,
            0x04 => self.wel = false,
            // WSR1; the busy and WEL bits are not writable.
            0x01 => self.sr1 = xact.args.first().copied().unwrap_or(0) & 0xFC,
            0x02 => {
                assert!(self.wel, "page program without write enable");
                let addr = address(&xact.args[..3]);
                let data = &xact.args[3..];
                assert!(!data.is_empty() && data.len() <= 256);
                assert!(
                    addr as usize % 256 + data.len() <= 256,
                    "page program crosses a page boundary at 0x{addr:06X}"
                );
                self.page_programs.push((addr, data.len()));
                for (i, &b) in data.iter().enumerate() {
                    let a = addr as usize + i;
                    if a < self.mem.len() {
                        // NOR semantics: program can only clear bits.
                        self.mem[a] &= b;
                    }
                }
                self.wel = false;
            }
            0x20 | 0x52 | 0xD8 => {
                assert!(self.wel, "erase without write enable");
                let addr = address(&xact.args[..3]);
                self.erases.push((xact.op, addr));
                let size = match xact.op {
                    0x20 => 4 * 1024,
                    0x52 => 32 * 1024,
                    _ => 64 * 1024,
                };
                let start = addr as usize & !(size - 1);
                let end = (start + size).min(self.mem.len());
                self.mem[start..end].fill(0xFF);
                self.wel = false;
            }
            0xC7 => {
                assert!(self.wel, "chip erase without write enable");
                self.chip_erases += 1;
                self.mem.fill(0xFF);
                self.wel = false;
            }
            _ => {}
        }
    }
}
