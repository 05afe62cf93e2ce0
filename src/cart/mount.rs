// cartridge load state
use log::debug;

use super::controller::Controller;
use super::error::Result;
use super::opcode::{Command, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountState {
    #[default]
    Unloaded,
    Loaded(u32),
}

/// Tracks the single mounted cartridge. Switching costs a controller round trip.
#[derive(Debug, Default)]
pub struct Mount {
    state: MountState,
    switches: u64,
}

impl Mount {
    #[cfg(test)]
    pub fn state(&self) -> MountState {
        self.state
    }

    /// Number of mount commands that succeeded.
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Mount `cartridge` unless it already is. On failure the prior state stays.
    pub fn ensure_loaded<C: Controller>(&mut self, ctrl: &mut C, cartridge: u32) -> Result<()> {
        if self.state == MountState::Loaded(cartridge) {
            return Ok(());
        }
        ctrl.execute(Opcode::request(Command::LdCart, cartridge, 0), None)?;
        debug!("mounted cartridge {cartridge} (was {:?})", self.state);
        self.state = MountState::Loaded(cartridge);
        self.switches += 1;
        Ok(())
    }

    /// Mount and zero every cartridge in `0..count`, ending on the last one.
    pub fn zero_all<C: Controller>(&mut self, ctrl: &mut C, count: u32) -> Result<()> {
        for cartridge in 0..count {
            self.ensure_loaded(ctrl, cartridge)?;
            ctrl.execute(Opcode::request(Command::BZero, cartridge, 0), None)?;
        }
        Ok(())
    }

    pub fn unload(&mut self) {
        self.state = MountState::Unloaded;
    }
}
