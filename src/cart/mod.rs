// cartridge driver root
mod cache;
mod controller;
mod error;
mod file;
mod mount;
pub mod net;
mod opcode;


use std::fmt;

use log::{debug, info};

use cache::FrameCache;
use file::{FileTable, FrameCursor};
use mount::Mount;

pub use cache::{CacheStats, DEFAULT_CACHE_FRAMES};
pub use controller::{Controller, MemoryController};
pub use error::{CartError, Result};
pub use file::FileHandle;
#[cfg(test)]
use mount::MountState;
pub use opcode::{Command, Opcode, MAX_INDEX};

pub const CART_FRAME_SIZE: usize = 1024;
pub const CART_CARTRIDGE_SIZE: u32 = 1024;
pub const CART_MAX_CARTRIDGES: u32 = 64;
pub const CART_MAX_TOTAL_FILES: usize = 1024;

/// Shape of the media and of the file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Bytes per frame, identical on every cartridge.
    pub frame_size: usize,
    pub frames_per_cartridge: u32,
    pub cartridges: u32,
    pub max_files: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            frame_size: CART_FRAME_SIZE,
            frames_per_cartridge: CART_CARTRIDGE_SIZE,
            cartridges: CART_MAX_CARTRIDGES,
            max_files: CART_MAX_TOTAL_FILES,
        }
    }
}

impl Geometry {
    /// Every index must fit the 16-bit register fields.
    pub fn validate(&self) -> Result<()> {
        if self.frame_size == 0 {
            return Err(CartError::InvalidGeometry("frame size is zero"));
        }
        if self.frames_per_cartridge == 0 || self.frames_per_cartridge > MAX_INDEX + 1 {
            return Err(CartError::InvalidGeometry(
                "frames per cartridge must be within 1..=65536",
            ));
        }
        if self.cartridges > MAX_INDEX + 1 {
            return Err(CartError::InvalidGeometry(
                "cartridge count must be at most 65536",
            ));
        }
        if self.max_files == 0 {
            return Err(CartError::InvalidGeometry("file table holds no files"));
        }
        Ok(())
    }
}

/// Global address of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameAddr {
    pub cartridge: u32,
    pub frame: u32,
}

impl fmt::Display for FrameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cartridge, self.frame)
    }
}

/// The storage context: controller, mount state, frame cache, file table and
/// allocation cursor, all owned by one value.
pub struct CartDriver<C> {
    ctrl: C,
    geometry: Geometry,
    mount: Mount,
    cache: Option<FrameCache>,
    cache_frames: Option<usize>,
    files: FileTable,
    cursor: FrameCursor,
    powered: bool,
}

impl<C: Controller> CartDriver<C> {
    pub fn new(ctrl: C, geometry: Geometry) -> Result<Self> {
        geometry.validate()?;
        Ok(Self {
            ctrl,
            geometry,
            mount: Mount::default(),
            cache: None,
            cache_frames: None,
            files: FileTable::new(geometry.max_files),
            cursor: FrameCursor::default(),
            powered: false,
        })
    }

    pub fn controller(&self) -> &C {
        &self.ctrl
    }

    #[cfg(test)]
    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.ctrl
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[cfg(test)]
    pub fn mount_state(&self) -> MountState {
        self.mount.state()
    }

    pub fn mount_switches(&self) -> u64 {
        self.mount.switches()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.as_ref().map(FrameCache::stats).unwrap_or_default()
    }

    /// Fix the cache capacity. Allowed once, before the cache is built; the
    /// setting then holds for every later power cycle.
    pub fn set_cache_size(&mut self, frames: usize) -> Result<()> {
        if self.cache.is_some() || self.cache_frames.is_some() {
            return Err(CartError::AlreadyInitialized);
        }
        if frames == 0 {
            return Err(CartError::InvalidCacheSize);
        }
        self.cache_frames = Some(frames);
        Ok(())
    }

    /// Initialize the media, zero every cartridge and start a fresh file system.
    pub fn power_on(&mut self) -> Result<()> {
        if self.powered {
            return Err(CartError::AlreadyInitialized);
        }
        self.ctrl
            .execute(Opcode::request(Command::InitMs, 0, 0), None)?;
        self.mount.unload();
        self.mount.zero_all(&mut self.ctrl, self.geometry.cartridges)?;

        self.files = FileTable::new(self.geometry.max_files);
        self.cursor = FrameCursor::default();
        let capacity = self.cache_frames.unwrap_or(DEFAULT_CACHE_FRAMES);
        self.cache = Some(FrameCache::new(capacity, self.geometry.frame_size));
        self.powered = true;

        info!(
            "powered on: {} cartridges x {} frames of {} bytes, cache {capacity} frames",
            self.geometry.cartridges, self.geometry.frames_per_cartridge, self.geometry.frame_size
        );
        Ok(())
    }

    /// Power the media off. Local state is torn down even if the controller
    /// refuses; its failure is reported afterwards.
    pub fn power_off(&mut self) -> Result<()> {
        if !self.powered {
            return Err(CartError::NotPoweredOn);
        }
        let res = self
            .ctrl
            .execute(Opcode::request(Command::PowOff, 0, 0), None);

        self.mount.unload();
        if let Some(cache) = self.cache.take() {
            debug!(
                "released {}-frame cache: {:?}",
                cache.capacity(),
                cache.stats()
            );
        }
        self.powered = false;
        info!("powered off");
        res.map(|_| ())
    }

    fn require_power(&self) -> Result<()> {
        if self.powered {
            Ok(())
        } else {
            Err(CartError::NotPoweredOn)
        }
    }

    /// Full contents of `addr`, from the cache or else from the media.
    fn load_frame(&mut self, addr: FrameAddr) -> Result<Vec<u8>> {
        let cache = self.cache.as_mut().ok_or(CartError::NotPoweredOn)?;
        if let Some(data) = cache.get(addr) {
            return Ok(data);
        }
        let data = self.read_media(addr)?;
        if let Some(cache) = self.cache.as_mut() {
            cache.put(addr, &data);
        }
        Ok(data)
    }

    /// Current contents of a frame that is about to be rewritten. The cached
    /// copy, if any, is taken out so a failed write cannot leave it stale.
    fn take_frame(&mut self, addr: FrameAddr) -> Result<Vec<u8>> {
        let cache = self.cache.as_mut().ok_or(CartError::NotPoweredOn)?;
        match cache.invalidate(addr) {
            Some(data) => Ok(data),
            None => self.read_media(addr),
        }
    }

    /// Push a frame to the media, then cache it.
    fn store_frame(&mut self, addr: FrameAddr, data: &mut [u8]) -> Result<()> {
        self.mount.ensure_loaded(&mut self.ctrl, addr.cartridge)?;
        self.ctrl.execute(
            Opcode::request(Command::WrFrme, addr.cartridge, addr.frame),
            Some(&mut *data),
        )?;
        if let Some(cache) = self.cache.as_mut() {
            cache.put(addr, data);
        }
        Ok(())
    }

    fn read_media(&mut self, addr: FrameAddr) -> Result<Vec<u8>> {
        let mut data = vec![0; self.geometry.frame_size];
        self.mount.ensure_loaded(&mut self.ctrl, addr.cartridge)?;
        self.ctrl.execute(
            Opcode::request(Command::RdFrme, addr.cartridge, addr.frame),
            Some(data.as_mut_slice()),
        )?;
        Ok(data)
    }
}
