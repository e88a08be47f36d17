mod registry;

pub use registry::{best_match_in, AssetRegistry, AssetSpec};
