//! JTAG access on top of the MPSSE transport.
//!
//! `JtagPort` tracks the TAP state, turns go-to-state requests into TMS
//! sequences and performs bit-granular scan-chain shifts. The `TapAccess`
//! trait is the seam everything above this layer is written against, so the
//! higher layers can be exercised with a simulated TAP in tests.

mod tap;

pub use tap::{TapState, TmsSequence, tms_sequence};

use crate::Error;
use crate::mpsse::{Mpsse, mc};

/// Bit-granular access to a single TAP.
pub trait TapAccess {
    /// The state the TAP is in after the last completed operation.
    fn current_state(&self) -> TapState;

    /// Moves the TAP along the shortest TMS path to `target`. No clocks are
    /// emitted when the TAP is already there.
    fn goto(&mut self, target: TapState) -> Result<(), Error>;

    /// Shifts `bits` bits through the scan chain: TDI from `data`, LSB first
    /// per byte, and TDO captured back into `data` the same way, unused high
    /// bits of the last byte zeroed. Must be called in Shift-DR or Shift-IR.
    ///
    /// With `advance`, TMS rises on the final bit and the TAP moves to
    /// Exit1; otherwise it stays in the Shift state so a later shift
    /// continues the same scan.
    fn shift(&mut self, data: &mut [u8], bits: usize, advance: bool) -> Result<(), Error>;

    /// Clocks TCK `clocks` times with TMS held low. Used for the idle pause
    /// the configuration engine needs after a command; the TAP must be in
    /// Run-Test/Idle.
    fn idle_clocks(&mut self, clocks: usize) -> Result<(), Error>;
}

pub struct JtagPort {
    mpsse: Mpsse,
    state: TapState,
}

impl JtagPort {
    /// Wraps an MPSSE transport and forces the TAP into Test-Logic-Reset.
    pub fn new(mpsse: Mpsse) -> Result<Self, Error> {
        let mut port = JtagPort {
            mpsse,
            state: TapState::TestLogicReset,
        };
        port.reset_tap()?;
        Ok(port)
    }

    /// Five TMS=1 clocks reach Test-Logic-Reset from any state.
    pub fn reset_tap(&mut self) -> Result<(), Error> {
        self.mpsse.send(&[mc::TMS_BITS, 4, 0b1_1111])?;
        self.state = TapState::TestLogicReset;
        Ok(())
    }

    /// Shifts whole bytes through the chain, reading TDO back into the same
    /// buffer, honouring the chip's receive buffer size.
    fn shift_bytes(&mut self, data: &mut [u8]) -> Result<(), Error> {
        let chunk_size = self.mpsse.buffer_size();
        for chunk in data.chunks_mut(chunk_size) {
            let n = (chunk.len() - 1) as u16;
            let [n_lo, n_hi] = n.to_le_bytes();

            let mut commands = Vec::with_capacity(chunk.len() + 4);
            commands.extend_from_slice(&[mc::DATA_BYTES_RW, n_lo, n_hi]);
            commands.extend_from_slice(chunk);
            commands.push(mc::SEND_IMMEDIATE);

            self.mpsse.xfer(&commands, chunk)?;
        }
        Ok(())
    }
}

/// Encodes the 1..=8 trailing bits of a shift. Returns the command bytes and
/// the number of response bytes they produce.
fn tail_commands(last_byte: u8, tail_bits: usize, advance: bool) -> (Vec<u8>, usize) {
    debug_assert!((1..=8).contains(&tail_bits));
    debug_assert!(advance || tail_bits < 8);

    let mut commands = Vec::with_capacity(7);
    let mut response_len = 0;

    if advance {
        if tail_bits > 1 {
            commands.extend_from_slice(&[mc::DATA_BITS_RW, (tail_bits - 2) as u8, last_byte]);
            response_len += 1;
        }
        // The final bit rides the TMS command: TDI in bit 7, TMS=1 so the
        // TAP leaves the Shift state on this clock.
        let last_bit = (last_byte >> (tail_bits - 1)) & 0x01;
        commands.extend_from_slice(&[mc::TMS_BITS_RW, 0x00, 0x01 | (last_bit << 7)]);
        response_len += 1;
    } else {
        commands.extend_from_slice(&[mc::DATA_BITS_RW, (tail_bits - 1) as u8, last_byte]);
        response_len += 1;
    }

    (commands, response_len)
}

/// Reassembles the trailing bits captured by `tail_commands` into one output
/// byte, first bit in bit 0.
fn tail_response(response: &[u8], tail_bits: usize, advance: bool) -> u8 {
    if advance {
        // Bit-mode reads shift in from the top of the byte; the TMS read
        // leaves its single captured bit in bit 7.
        let tms_bit = response[response.len() - 1] >> 7;
        let mut byte = tms_bit << (tail_bits - 1);
        if tail_bits > 1 {
            byte |= response[0] >> (8 - (tail_bits - 1));
        }
        byte
    } else {
        response[0] >> (8 - tail_bits)
    }
}

impl TapAccess for JtagPort {
    fn current_state(&self) -> TapState {
        self.state
    }

    fn goto(&mut self, target: TapState) -> Result<(), Error> {
        if self.state == target {
            return Ok(());
        }

        let seq = tms_sequence(self.state, target);
        self.mpsse.send(&[mc::TMS_BITS, seq.len - 1, seq.bits])?;
        self.state = target;
        Ok(())
    }

    fn shift(&mut self, data: &mut [u8], bits: usize, advance: bool) -> Result<(), Error> {
        assert!(bits > 0);
        assert!(data.len() * 8 >= bits);
        debug_assert!(self.state.is_shift());

        // When advancing, the final bit has to go out with the TMS command,
        // so at most bits-1 may be clocked as whole bytes.
        let full_bytes = if advance { (bits - 1) / 8 } else { bits / 8 };
        let tail_bits = bits - full_bytes * 8;

        if full_bytes > 0 {
            self.shift_bytes(&mut data[..full_bytes])?;
        }

        if tail_bits > 0 {
            let (commands, response_len) = tail_commands(data[full_bytes], tail_bits, advance);
            let mut commands = commands;
            commands.push(mc::SEND_IMMEDIATE);

            let mut response = [0u8; 2];
            self.mpsse.xfer(&commands, &mut response[..response_len])?;

            data[full_bytes] = tail_response(&response[..response_len], tail_bits, advance);
        }

        if advance {
            // TMS rose on the last bit: Shift-DR -> Exit1-DR (same for IR).
            self.state = self.state.step(true);
        }

        Ok(())
    }

    fn idle_clocks(&mut self, clocks: usize) -> Result<(), Error> {
        debug_assert_eq!(self.state, TapState::RunTestIdle);

        let mut remaining = clocks;
        let mut commands = Vec::with_capacity((clocks / 7 + 1) * 3);
        while remaining > 0 {
            let n = remaining.min(7);
            commands.extend_from_slice(&[mc::TMS_BITS, (n - 1) as u8, 0x00]);
            remaining -= n;
        }
        self.mpsse.send(&commands)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_of_a_byte_aligned_advance_shift() {
        // 8 trailing bits with advance: 7 through the bit command, 1 on TMS.
        let (cmd, resp_len) = tail_commands(0xA5, 8, true);
        assert_eq!(resp_len, 2);
        assert_eq!(&cmd[..3], &[mc::DATA_BITS_RW, 6, 0xA5]);
        // Bit 7 of 0xA5 is 1, so TDI rides high on the TMS byte.
        assert_eq!(&cmd[3..], &[mc::TMS_BITS_RW, 0x00, 0x81]);
    }

    #[test]
    fn tail_of_a_single_bit_advance_shift() {
        let (cmd, resp_len) = tail_commands(0x01, 1, true);
        assert_eq!(resp_len, 1);
        assert_eq!(cmd, vec![mc::TMS_BITS_RW, 0x00, 0x81]);
    }

    #[test]
    fn tail_without_advance_uses_the_bit_command_only() {
        let (cmd, resp_len) = tail_commands(0x15, 5, false);
        assert_eq!(resp_len, 1);
        assert_eq!(cmd, vec![mc::DATA_BITS_RW, 4, 0x15]);
    }

    #[test]
    fn tail_response_reassembly() {
        // 5 bits received in the order 1,0,1,1,0 land in the top five bits
        // of the response byte, first bit lowest.
        assert_eq!(tail_response(&[0b0110_1000], 5, false), 0b01101);

        // 3 bits 1,0,1 arrive as the top three bits.
        assert_eq!(tail_response(&[0b1010_0000], 3, false), 0b101);

        // 4 bits with advance: 3 bits from the bit read (top of byte 0),
        // final bit from the TMS read (bit 7 of byte 1).
        assert_eq!(tail_response(&[0b0110_0000, 0x80], 4, true), 0b1011);

        // Single-bit advance shift: only the TMS capture.
        assert_eq!(tail_response(&[0x80], 1, true), 0x01);
        assert_eq!(tail_response(&[0x00], 1, true), 0x00);
    }
}
