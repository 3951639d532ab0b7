mod arena;
mod group;
mod regime;

pub use arena::Arena;
pub use group::ShardGroup;
pub use regime::{AllocRegime, ShadowAllocator};
