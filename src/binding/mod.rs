//! Binding tables: pools, shader slot reflection and write composition

pub mod pool;
pub mod reflection;
pub mod write;

pub use pool::{BindingPool, BindingTable, PoolCapacities, TableLayout};
pub use reflection::{ShaderReflection, SlotDescriptor, SlotLayout};
pub use write::{write_for, WriteBatch, WriteRecord};
