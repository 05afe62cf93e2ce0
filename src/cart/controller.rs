// controller bus
use std::collections::HashMap;
use std::io;

use log::{error, trace};

use super::error::{CartError, Result};
use super::opcode::{Command, Opcode};
use super::Geometry;

/// The far side of the transfer register: something that stores frames.
///
/// A request is one encoded register plus, for frame reads and writes, a
/// frame-sized buffer. The response register echoes the request with the
/// return flag set on failure.
pub trait Controller {
    fn bus_request(&mut self, register: u64, frame: Option<&mut [u8]>) -> io::Result<u64>;

    /// Encode `request`, submit it and turn a failed response into an error.
    fn execute(&mut self, request: Opcode, frame: Option<&mut [u8]>) -> Result<Opcode> {
        let register = request.encode()?;
        trace!("bus send {register:#018x}");
        let reply = self.bus_request(register, frame)?;
        trace!("bus recv {reply:#018x}");
        let response = Opcode::decode(reply);

        if response.failed() {
            let command = request.command()?;
            error!(
                "CART driver failed: {command:?} cartridge {} frame {}",
                request.cartridge, request.frame
            );
            return Err(CartError::ControllerFailure {
                command,
                cartridge: request.cartridge,
                frame: request.frame,
            });
        }
        Ok(response)
    }
}

/// Operation counters kept by [`MemoryController`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BusCounters {
    pub mounts: u64,
    pub zeroes: u64,
    pub reads: u64,
    pub writes: u64,
}

/// Media held in RAM. Frames that were never written read back as zeros.
pub struct MemoryController {
    geometry: Geometry,
    frames: HashMap<(u32, u32), Vec<u8>>,
    loaded: Option<u32>,
    powered: bool,
    counters: BusCounters,
    /// Command that is forced to fail, for exercising error paths.
    fail_on: Option<Command>,
}

impl MemoryController {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            frames: HashMap::new(),
            loaded: None,
            powered: false,
            counters: BusCounters::default(),
            fail_on: None,
        }
    }

    pub fn counters(&self) -> BusCounters {
        self.counters
    }

    #[cfg(test)]
    pub fn loaded(&self) -> Option<u32> {
        self.loaded
    }

    /// Raw frame contents, bypassing the register protocol.
    #[cfg(test)]
    pub fn peek(&self, cartridge: u32, frame: u32) -> Vec<u8> {
        self.frames
            .get(&(cartridge, frame))
            .cloned()
            .unwrap_or_else(|| vec![0; self.geometry.frame_size])
    }

    /// Make every following `command` report failure.
    #[cfg(test)]
    pub fn fail_on(&mut self, command: Option<Command>) {
        self.fail_on = command;
    }

    fn dispatch(&mut self, request: Opcode, frame: Option<&mut [u8]>) -> bool {
        let Ok(command) = request.command() else {
            return false;
        };
        if self.fail_on == Some(command) {
            return false;
        }
        if !self.powered && command != Command::InitMs {
            return false;
        }

        match command {
            Command::InitMs => {
                self.powered = true;
                self.loaded = None;
                true
            }
            Command::LdCart => {
                if request.cartridge >= self.geometry.cartridges {
                    return false;
                }
                self.loaded = Some(request.cartridge);
                self.counters.mounts += 1;
                true
            }
            Command::BZero => {
                let Some(cart) = self.loaded else {
                    return false;
                };
                self.frames.retain(|&(c, _), _| c != cart);
                self.counters.zeroes += 1;
                true
            }
            Command::RdFrme => {
                let (Some(cart), Some(buf)) = (self.loaded, frame) else {
                    return false;
                };
                if !self.frame_fits(request.frame, buf) {
                    return false;
                }
                match self.frames.get(&(cart, request.frame)) {
                    Some(data) => buf.copy_from_slice(data),
                    None => buf.fill(0),
                }
                self.counters.reads += 1;
                true
            }
            Command::WrFrme => {
                let (Some(cart), Some(buf)) = (self.loaded, frame) else {
                    return false;
                };
                if !self.frame_fits(request.frame, buf) {
                    return false;
                }
                self.frames.insert((cart, request.frame), buf.to_vec());
                self.counters.writes += 1;
                true
            }
            Command::PowOff => {
                self.powered = false;
                self.loaded = None;
                true
            }
        }
    }

    fn frame_fits(&self, frame: u32, buf: &[u8]) -> bool {
        frame < self.geometry.frames_per_cartridge && buf.len() == self.geometry.frame_size
    }
}

impl Controller for MemoryController {
    fn bus_request(&mut self, register: u64, frame: Option<&mut [u8]>) -> io::Result<u64> {
        let mut response = Opcode::decode(register);
        response.return_flag = if self.dispatch(response, frame) { 0 } else { 1 };
        // request fields were decoded from a valid register, so they fit
        response
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Geometry {
        Geometry {
            frame_size: 8,
            frames_per_cartridge: 4,
            cartridges: 2,
            max_files: 4,
        }
    }

    fn powered() -> MemoryController {
        let mut ctrl = MemoryController::new(small());
        ctrl.execute(Opcode::request(Command::InitMs, 0, 0), None)
            .unwrap();
        ctrl
    }

    #[test]
    fn refuses_requests_before_init() {
        let mut ctrl = MemoryController::new(small());
        let err = ctrl
            .execute(Opcode::request(Command::LdCart, 0, 0), None)
            .unwrap_err();
        assert!(matches!(
            err,
            CartError::ControllerFailure {
                command: Command::LdCart,
                ..
            }
        ));
    }

    #[test]
    fn frames_follow_mounted_cartridge() {
        let mut ctrl = powered();
        let mut buf = [7u8; 8];

        ctrl.execute(Opcode::request(Command::LdCart, 1, 0), None)
            .unwrap();
        ctrl.execute(Opcode::request(Command::WrFrme, 1, 2), Some(&mut buf[..]))
            .unwrap();
        assert_eq!(ctrl.peek(1, 2), vec![7; 8]);
        assert_eq!(ctrl.peek(0, 2), vec![0; 8]);

        ctrl.execute(Opcode::request(Command::LdCart, 0, 0), None)
            .unwrap();
        let mut out = [0xFFu8; 8];
        ctrl.execute(Opcode::request(Command::RdFrme, 0, 2), Some(&mut out[..]))
            .unwrap();
        assert_eq!(out, [0; 8]);
        assert_eq!(ctrl.counters().mounts, 2);
    }

    #[test]
    fn zero_clears_only_mounted_cartridge() {
        let mut ctrl = powered();
        let mut buf = [1u8; 8];
        for cart in 0..2 {
            ctrl.execute(Opcode::request(Command::LdCart, cart, 0), None)
                .unwrap();
            ctrl.execute(Opcode::request(Command::WrFrme, cart, 0), Some(&mut buf[..]))
                .unwrap();
        }
        ctrl.execute(Opcode::request(Command::BZero, 1, 0), None)
            .unwrap();
        assert_eq!(ctrl.peek(0, 0), vec![1; 8]);
        assert_eq!(ctrl.peek(1, 0), vec![0; 8]);
    }

    #[test]
    fn out_of_range_requests_fail() {
        let mut ctrl = powered();
        assert!(ctrl
            .execute(Opcode::request(Command::LdCart, 2, 0), None)
            .is_err());
        ctrl.execute(Opcode::request(Command::LdCart, 0, 0), None)
            .unwrap();
        let mut buf = [0u8; 8];
        assert!(ctrl
            .execute(Opcode::request(Command::RdFrme, 0, 4), Some(&mut buf[..]))
            .is_err());
        let mut short = [0u8; 3];
        assert!(ctrl
            .execute(Opcode::request(Command::WrFrme, 0, 0), Some(&mut short[..]))
            .is_err());
    }

    #[test]
    fn power_off_drops_mount() {
        let mut ctrl = powered();
        ctrl.execute(Opcode::request(Command::LdCart, 1, 0), None)
            .unwrap();
        ctrl.execute(Opcode::request(Command::PowOff, 0, 0), None)
            .unwrap();
        assert_eq!(ctrl.loaded(), None);
        assert!(ctrl
            .execute(Opcode::request(Command::BZero, 0, 0), None)
            .is_err());
    }
}
