use thiserror::Error;

/// Errors from the pure tile/metatile coordinate arithmetic.
///
/// These indicate a misconfiguration (sizes are operator-supplied), so the
/// handler maps them to a 500 with `FetchState::ConfigError`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TileAlgebraError {
    /// Metatile size is not a power of two
    #[error("metatile size is required to be a power of two, but {0} is not")]
    MetaSizeNotPowerOfTwo(u32),

    /// Tile size is not a power of two
    #[error("tile size is required to be a power of two, but {0} is not")]
    TileSizeNotPowerOfTwo(u32),

    /// Tile size exceeds the metatile size
    #[error("tile size must not be greater than metatile size, but {tile_size} > {meta_size}")]
    TileLargerThanMeta { tile_size: u32, meta_size: u32 },
}

/// Errors raised while opening a metatile archive or extracting a member.
#[derive(Debug, Error)]
pub enum MetatileError {
    /// The archive is well-formed but does not contain the requested member
    #[error("unable to find relative tile offset {target:?} in metatile")]
    TileNotFound { target: String },

    /// The archive itself could not be parsed
    #[error("failed to open metatile archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// The member stream failed while being drained
    #[error("failed to read tile out of metatile: {0}")]
    Read(#[from] std::io::Error),
}

/// Errors from the backing stores.
///
/// `NotFound` and `NotModified` are *not* errors; they are ordinary variants
/// of `StorageResponse`. Everything here maps to a 500.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The object key template referenced an unknown variable
    #[error("unknown variable {variable:?} in key pattern {pattern:?}")]
    KeyTemplate { pattern: String, variable: String },

    /// Error from S3 or an S3-compatible service
    #[error("s3 error: {0}")]
    S3(String),

    /// Error while draining a storage response body
    #[error("storage read error: {0}")]
    Read(String),

    /// Filesystem error other than a missing file
    #[error("file storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from cache backends. Lookup failures are logged and treated as
/// misses; set failures are logged and never surfaced to the client.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Transport or backend failure
    #[error("cache backend error: {0}")]
    Backend(String),

    /// A cached value failed to decode
    #[error("cache codec error: {0}")]
    Codec(String),
}

/// The requested format extension is not in the configured MIME map.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid format: {bad_format}")]
pub struct MimeParseError {
    pub bad_format: String,
}

/// One or more of the z/x/y path variables failed to parse as an integer.
///
/// The fields hold the offending raw strings; only set fields are reported.
#[derive(Debug, Error, Clone, Default, PartialEq, Eq)]
pub struct CoordParseError {
    pub bad_z: Option<String>,
    pub bad_x: Option<String>,
    pub bad_y: Option<String>,
}

impl CoordParseError {
    pub fn is_error(&self) -> bool {
        self.bad_z.is_some() || self.bad_x.is_some() || self.bad_y.is_some()
    }
}

impl std::fmt::Display for CoordParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(z) = &self.bad_z {
            write!(f, "invalid z: {}", z)
        } else if let Some(x) = &self.bad_x {
            write!(f, "invalid x: {}", x)
        } else if let Some(y) = &self.bad_y {
            write!(f, "invalid y: {}", y)
        } else {
            write!(f, "no coord parse error")
        }
    }
}

/// A conditional request header (`If-Modified-Since`) carried an unparseable
/// date. Never fatal: the handler proceeds without the condition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CondParseError(pub chrono::ParseError);

/// Tagged error from the metatile request parser.
///
/// Exactly one sub-kind is carried; the display text is that sub-kind's
/// message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Unknown format extension, mapped to 404
    #[error(transparent)]
    Mime(MimeParseError),

    /// Malformed z/x/y, mapped to 400
    #[error(transparent)]
    Coord(CoordParseError),

    /// Malformed conditional date; the request continues without it
    #[error(transparent)]
    Cond(CondParseError),
}

/// Error from the tilejson request parser.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TileJsonParseError {
    /// The format is not one of mapbox/geojson/topojson, mapped to 404
    #[error("invalid tilejson format: {0}")]
    Format(String),

    /// Malformed conditional date; the request continues without it
    #[error(transparent)]
    Cond(CondParseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coord_error_reports_first_bad_field() {
        let err = CoordParseError {
            bad_z: Some("abc".to_string()),
            bad_x: Some("def".to_string()),
            bad_y: None,
        };
        assert!(err.is_error());
        assert_eq!(err.to_string(), "invalid z: abc");

        let err = CoordParseError {
            bad_y: Some("!".to_string()),
            ..Default::default()
        };
        assert_eq!(err.to_string(), "invalid y: !");
    }

    #[test]
    fn test_coord_error_default_is_not_an_error() {
        assert!(!CoordParseError::default().is_error());
    }

    #[test]
    fn test_parse_error_display_is_subkind_message() {
        let err = ParseError::Mime(MimeParseError {
            bad_format: "xyz".to_string(),
        });
        assert_eq!(err.to_string(), "invalid format: xyz");

        let err = ParseError::Coord(CoordParseError {
            bad_x: Some("nope".to_string()),
            ..Default::default()
        });
        assert_eq!(err.to_string(), "invalid x: nope");
    }

    #[test]
    fn test_tile_algebra_error_messages() {
        let err = TileAlgebraError::MetaSizeNotPowerOfTwo(3);
        assert!(err.to_string().contains("power of two"));
        assert!(err.to_string().contains('3'));

        let err = TileAlgebraError::TileLargerThanMeta {
            tile_size: 4,
            meta_size: 2,
        };
        assert!(err.to_string().contains("4 > 2"));
    }
}
