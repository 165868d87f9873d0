pub mod config;
pub mod csum;
pub mod engine;
pub mod frame;
pub mod maps;
pub mod mmap_area;
pub mod packet;
pub mod pipeline;
pub mod policy;
pub mod program;
pub mod ring;
pub mod socket;
pub mod store;
pub mod sync;
pub mod umem;
mod util;

/// Upper bound on the number of rx descriptors drained per cycle.
pub const RX_BATCH_SIZE: usize = 64;
