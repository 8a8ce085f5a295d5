mod registry_index;

pub use registry_index::RegistryIndex;
