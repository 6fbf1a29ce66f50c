//! Partition-to-node assignment for stages that redistribute data.

pub mod info;
pub mod layout;

pub use info::ShuffleInfo;
pub use layout::apportion_partitions;
