pub mod events;
pub mod models;
pub mod params;
pub mod presets;
pub mod session;
pub mod wildcards;

pub use events::{EventLog, RequestEvent};
pub use models::{best_match_in, AssetRegistry, AssetSpec};
pub use params::{
    standard_params, NumericWidth, ParamDataType, ParamDescriptor, ParamRegistry,
};
pub use presets::{Preset, PresetStore};
pub use session::{InterruptToken, Session};
pub use wildcards::{WildcardFile, WildcardStore};
