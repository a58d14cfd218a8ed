//! Shard loader: copies expert bytes from the backing files into pool slots

use super::{LayerFormat, ShardLocation, ShardRole};
use crate::pool::{read_full, Buffer, SlotIndex, SlotPool};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use tracing::trace;

/// A backing file, opened on first use and kept open
struct BackingFile {
    path: PathBuf,
    handle: Mutex<Option<File>>,
}

/// Reads shard byte spans into pool regions.
///
/// Host-addressable regions are filled by reading straight into the slot.
/// Other regions go through a staging buffer sized to the widest
/// single-expert shard and are written with [`Buffer::set`].
pub struct ShardLoader {
    files: Vec<BackingFile>,
    staging: Mutex<Vec<u8>>,
}

impl ShardLoader {
    pub fn new(files: &[PathBuf], staging_bytes: usize) -> Self {
        Self {
            files: files
                .iter()
                .map(|path| BackingFile {
                    path: path.clone(),
                    handle: Mutex::new(None),
                })
                .collect(),
            staging: Mutex::new(vec![0u8; staging_bytes.max(1)]),
        }
    }

    /// Copy `len` bytes at `loc` into `dst` at `dst_offset`
    pub fn copy_span(
        &self,
        loc: ShardLocation,
        len: usize,
        dst: &dyn Buffer,
        dst_offset: usize,
    ) -> Result<()> {
        let file_index = loc.file_index as usize;
        let backing = self.files.get(file_index).ok_or_else(|| {
            Error::invariant(format!(
                "file index {} outside {} backing files",
                file_index,
                self.files.len()
            ))
        })?;

        let mut handle = backing.handle.lock();
        if handle.is_none() {
            trace!("Opening {}", backing.path.display());
            *handle = Some(File::open(&backing.path)?);
        }
        let file = handle
            .as_mut()
            .ok_or_else(|| Error::invariant("backing file handle missing after open"))?;
        file.seek(SeekFrom::Start(loc.byte_offset))?;

        let got = if dst.is_host() {
            dst.read_from(dst_offset, len, file)?
        } else {
            let mut staging = self.staging.lock();
            let mut done = 0;
            while done < len {
                let chunk = staging.len().min(len - done);
                let n = read_full(file, &mut staging[..chunk])?;
                dst.set(dst_offset + done, &staging[..n])?;
                done += n;
                if n < chunk {
                    break;
                }
            }
            done
        };

        if got != len {
            return Err(Error::ShortRead {
                file: file_index,
                offset: loc.byte_offset,
                expected: len,
                got,
            });
        }
        trace!(
            "Copied {} bytes from file {} @ {} to +{}",
            len,
            file_index,
            loc.byte_offset,
            dst_offset
        );
        Ok(())
    }

    /// Load one expert's three shards into `slot`. Returns bytes read.
    pub fn load_expert(
        &self,
        pool: &SlotPool,
        locations: &[ShardLocation; 3],
        format: &LayerFormat,
        slot: SlotIndex,
    ) -> Result<u64> {
        let mut bytes = 0u64;
        for role in ShardRole::ALL {
            let len = format.expert_bytes(role);
            self.copy_span(
                locations[role.index()],
                len,
                pool.region(role),
                pool.slot_offset(role, slot),
            )?;
            bytes += len as u64;
        }
        Ok(bytes)
    }

    /// Load every expert of a layer into `head..head + n_expert`.
    ///
    /// `base` holds the locations of expert 0. When the layer's experts are
    /// exactly slot-wide the whole shard is one read per role; narrower
    /// experts are read one by one so each lands at its slot boundary.
    pub fn load_layer(
        &self,
        pool: &SlotPool,
        base: &[ShardLocation; 3],
        format: &LayerFormat,
        n_expert: usize,
        head: SlotIndex,
    ) -> Result<u64> {
        let mut bytes = 0u64;
        for role in ShardRole::ALL {
            let len = format.expert_bytes(role);
            let start = base[role.index()];
            let region = pool.region(role);
            if len == pool.geometry(role).slot_bytes {
                self.copy_span(start, len * n_expert, region, pool.slot_offset(role, head))?;
            } else {
                for j in 0..n_expert {
                    let loc = ShardLocation {
                        file_index: start.file_index,
                        byte_offset: start.byte_offset + (j * len) as u64,
                    };
                    self.copy_span(loc, len, region, pool.slot_offset(role, head + j))?;
                }
            }
            bytes += (len * n_expert) as u64;
        }
        Ok(bytes)
    }
}
