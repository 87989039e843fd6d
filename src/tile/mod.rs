//! Tile coordinates and metatile arithmetic.
//!
//! A metatile is a ZIP archive holding an N×N block of adjacent tiles at a
//! possibly deeper zoom than the archive's own coordinate. The functions here
//! map a requested tile coordinate to the coordinate of its containing
//! metatile and the offset of the member inside it.

mod reader;

pub use reader::MetatileReader;

use serde::{Deserialize, Serialize};

use crate::error::TileAlgebraError;

/// The reserved format extension for metatile containers.
pub const METATILE_FORMAT: &str = "zip";

/// A single (z, x, y, format) tile address.
///
/// `z` is the zoom level; `x` and `y` index the 2^z × 2^z tile grid. The
/// format is an opaque extension string such as `json`, `mvt` or `zip`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: i32,
    pub x: i32,
    pub y: i32,
    pub format: String,
}

impl TileCoord {
    pub fn new(z: i32, x: i32, y: i32, format: impl Into<String>) -> Self {
        Self {
            z,
            x,
            y,
            format: format.into(),
        }
    }

    /// Render the coordinate as `{z}/{x}/{y}.{format}`.
    ///
    /// This string is both the ZIP member name for offset coordinates and a
    /// substitution variable in storage key patterns.
    pub fn file_name(&self) -> String {
        format!("{}/{}/{}.{}", self.z, self.x, self.y, self.format)
    }

    /// Compute the containing metatile coordinate and the offset of this
    /// tile inside it.
    ///
    /// `meta_size` and `tile_size` are both in units of "standard" 256px
    /// tiles and must be powers of two with `tile_size <= meta_size`. For
    /// example, to extract a regular 256px tile from a 2x2 metatile call
    /// `meta_and_offset(2, 1, 0)`; for the 512px tile from the same archive
    /// call `meta_and_offset(2, 2, 0)`.
    ///
    /// `max_detail_zoom`, when positive, bounds the zoom at which metatiles
    /// were materialized: requests deeper than that are resolved against the
    /// deepest available metatile with a correspondingly deeper offset. Zero
    /// disables the clamp.
    ///
    /// When the reduction in zoom would take the metatile "outside the
    /// world" (negative zoom), the result clamps to the root metatile, which
    /// keeps e.g. the 512px world tile addressable.
    pub fn meta_and_offset(
        &self,
        meta_size: u32,
        tile_size: u32,
        max_detail_zoom: i32,
    ) -> Result<(TileCoord, TileCoord), TileAlgebraError> {
        if !is_power_of_two(meta_size) {
            return Err(TileAlgebraError::MetaSizeNotPowerOfTwo(meta_size));
        }
        if !is_power_of_two(tile_size) {
            return Err(TileAlgebraError::TileSizeNotPowerOfTwo(tile_size));
        }

        let meta_zoom = meta_size.trailing_zeros();
        let tile_zoom = tile_size.trailing_zeros();
        if tile_zoom > meta_zoom {
            return Err(TileAlgebraError::TileLargerThanMeta {
                tile_size,
                meta_size,
            });
        }
        let delta_z = (meta_zoom - tile_zoom) as i32;

        // a metatile "larger than the world" clamps to the root archive,
        // whose only relevant member is the root tile
        if self.z < delta_z {
            return Ok((
                TileCoord::new(0, 0, 0, METATILE_FORMAT),
                TileCoord::new(0, 0, 0, self.format.clone()),
            ));
        }

        let mut meta = TileCoord::new(
            self.z - delta_z,
            self.x >> delta_z,
            self.y >> delta_z,
            METATILE_FORMAT,
        );

        // Metatiles were only materialized down to max_detail_zoom; deeper
        // requests resolve against the deepest archive with a deeper offset.
        if max_detail_zoom > 0 && meta.z > max_detail_zoom {
            let extra = meta.z - max_detail_zoom;
            meta.z = max_detail_zoom;
            meta.x >>= extra;
            meta.y >>= extra;
        }

        let offset_z = self.z - meta.z;
        let offset = TileCoord::new(
            offset_z,
            self.x - (meta.x << offset_z),
            self.y - (meta.y << offset_z),
            self.format.clone(),
        );

        Ok((meta, offset))
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file_name())
    }
}

/// True iff `i > 0` and `i` has a single bit set.
pub fn is_power_of_two(i: u32) -> bool {
    i > 0 && (i & (i - 1)) == 0
}
