// driver error taxonomy
use std::io;

use thiserror::Error;

use super::opcode::Command;

/// Everything the cartridge driver can report back to a caller.
#[derive(Error, Debug)]
pub enum CartError {
    #[error("opcode field `{field}` does not fit its bit width (value {value:#x})")]
    InvalidField { field: &'static str, value: u64 },

    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),

    #[error("bad file handle {0}")]
    BadHandle(usize),

    #[error("file `{0}` is already open")]
    AlreadyOpen(String),

    #[error("file handle {0} is closed")]
    FileClosed(usize),

    #[error("offset {offset} is past end of file ({len})")]
    OutOfRange { offset: usize, len: usize },

    #[error("controller failed {command:?} (cartridge {cartridge}, frame {frame})")]
    ControllerFailure {
        command: Command,
        cartridge: u32,
        frame: u32,
    },

    #[error("driver is already initialized")]
    AlreadyInitialized,

    #[error("cache capacity must be at least one frame")]
    InvalidCacheSize,

    #[error("invalid geometry: {0}")]
    InvalidGeometry(&'static str),

    #[error("file table is full ({0} files)")]
    TooManyFiles(usize),

    #[error("no free frames left on any cartridge")]
    MediaFull,

    #[error("driver is not powered on")]
    NotPoweredOn,

    #[error("controller transport: {0}")]
    Transport(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CartError>;
