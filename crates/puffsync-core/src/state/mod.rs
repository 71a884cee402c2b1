// # Baseline Store Implementations
//
// Implementations of the BaselineStore trait for different persistence
// strategies.

pub mod file;
pub mod memory;

pub use file::FileBaselineStore;
pub use memory::MemoryBaselineStore;
