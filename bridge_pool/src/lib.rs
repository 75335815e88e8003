//! gRPC Channel Pool (C5, spec.md §4.5) and gRPC Invoker (C6, spec.md
//! §4.6). The Invoker lives here rather than in a separate crate since it
//! only ever acts on channels this pool hands out.

pub mod invoker;
pub mod pool;

pub use invoker::Invoker;
pub use pool::{ChannelPool, ChannelPoolConfig, PooledChannel};
