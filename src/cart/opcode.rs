// opcode register codec
//
// Layout of the 64-bit transfer register, MSB first:
//
//   63..56  command
//   55..48  sub-command
//   47      return flag (set by the responder, 1 = failure)
//   46..31  cartridge index
//   30..15  frame index
//   14..0   reserved, zero on encode
use super::error::{CartError, Result};

const COMMAND_SHIFT: u32 = 56;
const SUB_COMMAND_SHIFT: u32 = 48;
const RETURN_SHIFT: u32 = 47;
const CARTRIDGE_SHIFT: u32 = 31;
const FRAME_SHIFT: u32 = 15;

const BYTE_MASK: u64 = 0xFF;
const RETURN_MASK: u64 = 0x1;
const INDEX_MASK: u64 = 0xFFFF;

/// Largest cartridge or frame index the register can carry.
pub const MAX_INDEX: u32 = INDEX_MASK as u32;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Initialize the media system.
    InitMs = 0,
    /// Zero every frame of the mounted cartridge.
    BZero = 1,
    /// Mount a cartridge.
    LdCart = 2,
    /// Read one frame of the mounted cartridge.
    RdFrme = 3,
    /// Write one frame of the mounted cartridge.
    WrFrme = 4,
    /// Power the media system off.
    PowOff = 5,
}

impl TryFrom<u8> for Command {
    type Error = CartError;

    fn try_from(value: u8) -> Result<Self> {
        use Command::*;
        Ok(match value {
            0 => InitMs,
            1 => BZero,
            2 => LdCart,
            3 => RdFrme,
            4 => WrFrme,
            5 => PowOff,
            other => return Err(CartError::UnknownCommand(other)),
        })
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> u8 {
        command as u8
    }
}

/// One unpacked transfer register.
///
/// Fields are kept wider than their wire slots so that [`Opcode::encode`] can
/// reject values that would spill into a neighbouring field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Opcode {
    pub command: u8,
    pub sub_command: u8,
    pub return_flag: u8,
    pub cartridge: u32,
    pub frame: u32,
}

impl Opcode {
    /// Request register for `command` aimed at (`cartridge`, `frame`).
    pub fn request(command: Command, cartridge: u32, frame: u32) -> Self {
        Self {
            command: command.into(),
            cartridge,
            frame,
            ..Self::default()
        }
    }

    pub fn command(&self) -> Result<Command> {
        Command::try_from(self.command)
    }

    pub fn failed(&self) -> bool {
        self.return_flag != 0
    }

    /// Pack the record into a wire value. Only bit widths are checked.
    pub fn encode(&self) -> Result<u64> {
        let return_flag = fit("return_flag", self.return_flag as u64, RETURN_MASK)?;
        let cartridge = fit("cartridge", self.cartridge as u64, INDEX_MASK)?;
        let frame = fit("frame", self.frame as u64, INDEX_MASK)?;

        Ok(((self.command as u64) << COMMAND_SHIFT)
            | ((self.sub_command as u64) << SUB_COMMAND_SHIFT)
            | (return_flag << RETURN_SHIFT)
            | (cartridge << CARTRIDGE_SHIFT)
            | (frame << FRAME_SHIFT))
    }

    /// Unpack a wire value. Total: reserved bits are ignored.
    pub fn decode(register: u64) -> Self {
        Self {
            command: ((register >> COMMAND_SHIFT) & BYTE_MASK) as u8,
            sub_command: ((register >> SUB_COMMAND_SHIFT) & BYTE_MASK) as u8,
            return_flag: ((register >> RETURN_SHIFT) & RETURN_MASK) as u8,
            cartridge: ((register >> CARTRIDGE_SHIFT) & INDEX_MASK) as u32,
            frame: ((register >> FRAME_SHIFT) & INDEX_MASK) as u32,
        }
    }
}

fn fit(field: &'static str, value: u64, mask: u64) -> Result<u64> {
    if value & !mask != 0 {
        return Err(CartError::InvalidField { field, value });
    }
    Ok(value)
}
