// file layer: open file table, frame cursor and byte-stream I/O
use std::fmt;

use log::{debug, warn};

use super::controller::Controller;
use super::error::{CartError, Result};
use super::{CartDriver, FrameAddr, Geometry};

/// Opaque index into the open file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(usize);

impl FileHandle {
    #[cfg(test)]
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd{}", self.0)
    }
}

struct OpenFile {
    path: String,
    /// Frame address for each logical frame, in order. Only ever appended to.
    frames: Vec<FrameAddr>,
    pos: usize,
    end: usize,
    open: bool,
}

/// Every path ever opened. Entries are never removed, only closed.
pub(super) struct FileTable {
    files: Vec<OpenFile>,
    max_files: usize,
}

impl FileTable {
    pub(super) fn new(max_files: usize) -> Self {
        Self {
            files: Vec::new(),
            max_files,
        }
    }

    fn entry(&self, handle: FileHandle) -> Result<&OpenFile> {
        self.files.get(handle.0).ok_or_else(|| {
            warn!("CART driver failed: bad file handle {handle}");
            CartError::BadHandle(handle.0)
        })
    }

    fn open_entry(&self, handle: FileHandle) -> Result<&OpenFile> {
        let file = self.entry(handle)?;
        if !file.open {
            warn!("CART driver failed: {handle} ({}) is closed", file.path);
            return Err(CartError::FileClosed(handle.0));
        }
        Ok(file)
    }

    fn open_entry_mut(&mut self, handle: FileHandle) -> Result<&mut OpenFile> {
        self.open_entry(handle)?;
        Ok(&mut self.files[handle.0])
    }
}

/// Next never-used frame. Moves forward only; frames are not reclaimed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct FrameCursor {
    cartridge: u32,
    frame: u32,
}

impl FrameCursor {
    fn remaining(&self, geometry: &Geometry) -> u64 {
        if self.cartridge >= geometry.cartridges {
            return 0;
        }
        let carts = (geometry.cartridges - self.cartridge) as u64;
        carts * geometry.frames_per_cartridge as u64 - self.frame as u64
    }

    fn allocate(&mut self, geometry: &Geometry) -> Result<FrameAddr> {
        if self.remaining(geometry) == 0 {
            return Err(CartError::MediaFull);
        }
        let addr = FrameAddr {
            cartridge: self.cartridge,
            frame: self.frame,
        };
        self.frame += 1;
        if self.frame >= geometry.frames_per_cartridge {
            self.cartridge += 1;
            self.frame = 0;
        }
        Ok(addr)
    }
}

impl<C: Controller> CartDriver<C> {
    /// Open `path`, creating it empty on first use.
    pub fn open(&mut self, path: &str) -> Result<FileHandle> {
        self.require_power()?;

        if let Some(idx) = self.files.files.iter().position(|f| f.path == path) {
            let file = &mut self.files.files[idx];
            if file.open {
                warn!("CART driver failed: `{path}` is already open");
                return Err(CartError::AlreadyOpen(path.to_string()));
            }
            file.open = true;
            file.pos = 0;
            debug!("reopened `{path}` as fd{idx} ({} bytes)", file.end);
            return Ok(FileHandle(idx));
        }

        if self.files.files.len() >= self.files.max_files {
            warn!("CART driver failed: file table is full");
            return Err(CartError::TooManyFiles(self.files.max_files));
        }
        self.files.files.push(OpenFile {
            path: path.to_string(),
            frames: Vec::new(),
            pos: 0,
            end: 0,
            open: true,
        });
        let handle = FileHandle(self.files.files.len() - 1);
        debug!("created `{path}` as {handle}");
        Ok(handle)
    }

    /// Close an open file. A handle outside the table is `BadHandle`; one
    /// whose file is already closed is `FileClosed`.
    pub fn close(&mut self, handle: FileHandle) -> Result<()> {
        self.require_power()?;
        self.files.open_entry_mut(handle)?.open = false;
        Ok(())
    }

    /// Move the position to `offset`, which may equal but not pass the end.
    pub fn seek(&mut self, handle: FileHandle, offset: usize) -> Result<()> {
        self.require_power()?;
        let file = self.files.open_entry_mut(handle)?;
        if offset > file.end {
            warn!("CART driver failed: seek to {offset} past end {}", file.end);
            return Err(CartError::OutOfRange {
                offset,
                len: file.end,
            });
        }
        file.pos = offset;
        Ok(())
    }

    /// Read up to `count` bytes from the current position. An empty result
    /// means end of file. Fails with `BadHandle` or `FileClosed` before any
    /// frame is touched.
    pub fn read(&mut self, handle: FileHandle, count: usize) -> Result<Vec<u8>> {
        self.require_power()?;
        let file = self.files.open_entry(handle)?;
        let mut pos = file.pos;
        let end = pos + count.min(file.end - file.pos);
        let frame_size = self.geometry.frame_size;

        let mut out = Vec::with_capacity(end - pos);
        while pos < end {
            let offset = pos % frame_size;
            let take = (frame_size - offset).min(end - pos);
            let addr = self.frame_at(handle, pos / frame_size)?;

            let frame = self.load_frame(addr)?;
            out.extend_from_slice(&frame[offset..offset + take]);
            pos += take;
            self.files.open_entry_mut(handle)?.pos = pos;
        }
        Ok(out)
    }

    /// Write all of `data` at the current position, growing the file as
    /// needed. Frames already written stay written if a later one fails.
    /// Handle errors (`BadHandle`, `FileClosed`) and `MediaFull` are reported
    /// before any frame I/O.
    pub fn write(&mut self, handle: FileHandle, data: &[u8]) -> Result<usize> {
        self.require_power()?;
        let file = self.files.open_entry(handle)?;
        let frame_size = self.geometry.frame_size;
        let mut pos = file.pos;

        let needed = (pos + data.len()).div_ceil(frame_size);
        let fresh = needed.saturating_sub(file.frames.len()) as u64;
        if fresh > self.cursor.remaining(&self.geometry) {
            warn!("CART driver failed: {fresh} new frames requested, media is full");
            return Err(CartError::MediaFull);
        }

        let mut written = 0;
        while written < data.len() {
            let slot = pos / frame_size;
            let offset = pos % frame_size;
            let take = (frame_size - offset).min(data.len() - written);

            let existing = self.files.open_entry(handle)?.frames.get(slot).copied();
            let (addr, mut frame) = match existing {
                Some(addr) => (addr, self.take_frame(addr)?),
                None => {
                    let addr = self.cursor.allocate(&self.geometry)?;
                    debug!("{handle}: logical frame {slot} -> {addr}");
                    self.files.open_entry_mut(handle)?.frames.push(addr);
                    (addr, vec![0; frame_size])
                }
            };

            frame[offset..offset + take].copy_from_slice(&data[written..written + take]);
            self.store_frame(addr, &mut frame)?;

            written += take;
            pos += take;
            let file = self.files.open_entry_mut(handle)?;
            file.pos = pos;
            file.end = file.end.max(pos);
        }
        Ok(written)
    }

    /// Frame addresses backing the file, in logical order.
    pub fn frames(&self, handle: FileHandle) -> Result<&[FrameAddr]> {
        Ok(&self.files.entry(handle)?.frames)
    }

    pub fn position(&self, handle: FileHandle) -> Result<usize> {
        Ok(self.files.entry(handle)?.pos)
    }

    pub fn len(&self, handle: FileHandle) -> Result<usize> {
        Ok(self.files.entry(handle)?.end)
    }

    fn frame_at(&self, handle: FileHandle, slot: usize) -> Result<FrameAddr> {
        let file = self.files.open_entry(handle)?;
        file.frames.get(slot).copied().ok_or(CartError::OutOfRange {
            offset: slot * self.geometry.frame_size,
            len: file.end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(frames_per_cartridge: u32, cartridges: u32) -> Geometry {
        Geometry {
            frame_size: 4,
            frames_per_cartridge,
            cartridges,
            max_files: 2,
        }
    }

    #[test]
    fn cursor_rolls_to_next_cartridge() {
        let g = geometry(2, 2);
        let mut cursor = FrameCursor::default();
        let got: Vec<_> = (0..4).map(|_| cursor.allocate(&g).unwrap()).collect();
        assert_eq!(
            got,
            vec![
                FrameAddr { cartridge: 0, frame: 0 },
                FrameAddr { cartridge: 0, frame: 1 },
                FrameAddr { cartridge: 1, frame: 0 },
                FrameAddr { cartridge: 1, frame: 1 },
            ]
        );
        assert_eq!(cursor.remaining(&g), 0);
        assert!(matches!(cursor.allocate(&g), Err(CartError::MediaFull)));
    }

    #[test]
    fn cursor_without_cartridges_is_full() {
        let g = geometry(8, 0);
        let mut cursor = FrameCursor::default();
        assert_eq!(cursor.remaining(&g), 0);
        assert!(cursor.allocate(&g).is_err());
    }

    #[test]
    fn remaining_counts_partial_cartridge() {
        let g = geometry(3, 2);
        let mut cursor = FrameCursor::default();
        cursor.allocate(&g).unwrap();
        assert_eq!(cursor.remaining(&g), 5);
    }

    #[test]
    fn handles_are_checked() {
        let mut table = FileTable::new(2);
        table.files.push(OpenFile {
            path: "a".into(),
            frames: Vec::new(),
            pos: 0,
            end: 0,
            open: false,
        });
        assert!(matches!(
            table.entry(FileHandle::from_raw(1)),
            Err(CartError::BadHandle(1))
        ));
        assert!(table.entry(FileHandle::from_raw(0)).is_ok());
        assert!(matches!(
            table.open_entry(FileHandle::from_raw(0)),
            Err(CartError::FileClosed(0))
        ));
    }
}
