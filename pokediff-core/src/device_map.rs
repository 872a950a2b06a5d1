use serde::{Deserialize, Serialize};

/// Where the pipeline is placed.
///
/// `Ordinal` always means an accelerator: there is no silent fallback to the
/// CPU. `ForceCpu` is an explicit opt-in for development machines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}
