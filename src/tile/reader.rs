//! Random-access reader over an in-memory metatile archive.
//!
//! Metatiles are standard ZIP archives whose members are named
//! `{z}/{x}/{y}.{fmt}` relative to the archive root. The whole archive is
//! materialized in memory before reading; members are small, so a full
//! central-directory scan plus a single decode is cheap.

use std::io::Cursor;

use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::MetatileError;
use crate::tile::TileCoord;

/// A ZIP central-directory view over a metatile held in memory.
///
/// Generic over the backing byte region, so it can borrow a pooled buffer
/// or own a `Bytes` without copying either.
pub struct MetatileReader<R: AsRef<[u8]>> {
    archive: ZipArchive<Cursor<R>>,
}

impl<R: AsRef<[u8]>> MetatileReader<R> {
    /// Open the archive. Fails with `MetatileError::Archive` when the bytes
    /// are not a well-formed ZIP.
    pub fn open(data: R) -> Result<Self, MetatileError> {
        let archive = ZipArchive::new(Cursor::new(data))?;
        Ok(Self { archive })
    }

    /// Number of members in the archive.
    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.len() == 0
    }

    /// Decode the member named `offset.file_name()` into `out`.
    ///
    /// Member lookup is exact and case-sensitive. Returns the member's
    /// declared uncompressed size, which is reported as the tile's logical
    /// size even if the copy produced a different count.
    pub fn extract(
        &mut self,
        offset: &TileCoord,
        out: &mut Vec<u8>,
    ) -> Result<u64, MetatileError> {
        let target = offset.file_name();
        let mut member = match self.archive.by_name(&target) {
            Ok(member) => member,
            Err(ZipError::FileNotFound) => {
                return Err(MetatileError::TileNotFound { target });
            }
            Err(err) => return Err(MetatileError::Archive(err)),
        };

        let size = member.size();
        std::io::copy(&mut member, out)?;
        Ok(size)
    }
}
