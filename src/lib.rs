//! Metatile gateway - serves individual map tiles out of ZIP metatiles.
//!
//! This library implements the request pipeline: coordinate parsing,
//! metatile coordinate and offset computation, a two-level cache probe, an
//! object-store or filesystem fetch, in-memory ZIP random access, and
//! conditional HTTP response assembly, plus the observability that records
//! what every stage did.

pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod state;
pub mod storage;
pub mod tile;

// Re-export commonly used types
pub use buffer::{BufferLease, BufferManager, OnDemandBufferManager, PooledBufferManager};
pub use cache::{Cache, DynamoDbCache, InMemoryCache, NullCache, RedisCache};
pub use config::{Config, HandlerConfig};
pub use error::{
    CacheError, CondParseError, CoordParseError, MetatileError, MimeParseError, ParseError,
    StorageError, TileAlgebraError, TileJsonParseError,
};
pub use metrics::{MetricsWriter, NilMetricsWriter, StatsdMetricsWriter};
pub use server::{
    build_router, GatewayComponents, MetatileRouteState, ReadinessFlag, TileJsonRouteState,
};
pub use state::{
    FetchState, ParseKind, ParseResult, RequestState, ResponseState, TileJsonRequestState,
    VectorTileResponseData,
};
pub use storage::{
    create_s3_client, Condition, FileStorage, S3Storage, Storage, StorageResponse, TileJsonFormat,
};
pub use tile::{is_power_of_two, MetatileReader, TileCoord};
