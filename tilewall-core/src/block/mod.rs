//! Block framing: pixel blocks, the groups they travel in, the pool
//! that recycles groups, and the group wire format.

pub mod group;
pub mod header;
pub mod io;
pub mod partition;
pub mod pool;
pub mod types;

pub use group::{BlockGroup, GroupSpec, PixelBlock};
pub use header::{GROUP_HEADER_SIZE, GroupFlag, GroupHeader};
pub use partition::{BlockPartition, Route};
pub use pool::{BlockPool, GroupKind, PoolOptions, SharedGroup};
pub use types::{FrameBuffer, PixelFormat};
