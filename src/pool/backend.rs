//! Storage backends for pool regions

use crate::{Error, Result};
use memmap2::MmapMut;
use parking_lot::RwLock;
use std::io::{self, Read};

/// Where pool regions are allocated and how big that memory is
pub trait Backend: Send + Sync {
    /// Backend name for diagnostics
    fn name(&self) -> &str;

    /// Total memory the backend can place pool regions in, in bytes
    fn memory_total(&self) -> Result<u64>;

    /// Allocate a zeroed buffer of `size` bytes
    fn alloc_buffer(&self, size: usize) -> Result<Box<dyn Buffer>>;
}

/// One region of pool storage
pub trait Buffer: Send + Sync {
    /// Size in bytes
    fn size(&self) -> usize;

    /// Whether the host can read file bytes straight into this buffer
    fn is_host(&self) -> bool;

    /// Read up to `len` bytes from `src` directly into `[offset, offset + len)`.
    /// Returns the number of bytes read, which is short only at end of input.
    /// Only valid for host buffers.
    fn read_from(&self, offset: usize, len: usize, src: &mut dyn Read) -> Result<usize>;

    /// Copy `data` into the buffer at `offset`
    fn set(&self, offset: usize, data: &[u8]) -> Result<()>;

    /// Copy bytes at `offset` out into `out`
    fn get(&self, offset: usize, out: &mut [u8]) -> Result<()>;
}

/// Fill `buf` from `src`, stopping early only at end of input
pub(crate) fn read_full(src: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Host memory backend
#[derive(Debug, Clone)]
pub struct CpuBackend {
    memory_total: Option<u64>,
    host_visible: bool,
}

impl CpuBackend {
    /// Backend sized by the machine's physical memory
    pub fn new() -> Self {
        Self {
            memory_total: None,
            host_visible: true,
        }
    }

    /// Backend reporting a fixed memory size
    pub fn with_memory(bytes: u64) -> Self {
        Self {
            memory_total: Some(bytes),
            host_visible: true,
        }
    }

    /// Buffers from this backend refuse direct reads, so every load goes
    /// through a staging buffer and `set`, as it would for device memory
    pub fn staged(mut self) -> Self {
        self.host_visible = false;
        self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        if self.host_visible {
            "CPU"
        } else {
            "CPU_Staged"
        }
    }

    fn memory_total(&self) -> Result<u64> {
        if let Some(bytes) = self.memory_total {
            return Ok(bytes);
        }
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        Ok(sys.total_memory())
    }

    fn alloc_buffer(&self, size: usize) -> Result<Box<dyn Buffer>> {
        if size == 0 {
            return Err(Error::Memory("cannot allocate an empty pool region".to_string()));
        }
        let mem = MmapMut::map_anon(size)
            .map_err(|e| Error::Memory(format!("failed to map {} bytes: {}", size, e)))?;
        Ok(Box::new(ArenaBuffer {
            mem: RwLock::new(mem),
            host: self.host_visible,
        }))
    }
}

/// Anonymous-mapped arena
struct ArenaBuffer {
    mem: RwLock<MmapMut>,
    host: bool,
}

impl ArenaBuffer {
    fn check(&self, offset: usize, len: usize) -> Result<()> {
        let size = self.mem.read().len();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(Error::invariant(format!(
                "buffer access [{}, +{}) outside {} bytes",
                offset, len, size
            ))),
        }
    }
}

impl Buffer for ArenaBuffer {
    fn size(&self) -> usize {
        self.mem.read().len()
    }

    fn is_host(&self) -> bool {
        self.host
    }

    fn read_from(&self, offset: usize, len: usize, src: &mut dyn Read) -> Result<usize> {
        if !self.host {
            return Err(Error::invariant("direct read into a buffer that is not host-addressable"));
        }
        self.check(offset, len)?;
        let mut mem = self.mem.write();
        Ok(read_full(src, &mut mem[offset..offset + len])?)
    }

    fn set(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        let mut mem = self.mem.write();
        mem[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn get(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check(offset, out.len())?;
        let mem = self.mem.read();
        out.copy_from_slice(&mem[offset..offset + out.len()]);
        Ok(())
    }
}
