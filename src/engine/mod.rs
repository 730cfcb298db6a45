pub mod decision;
pub mod position_state;

pub use decision::{StopCandidate, StopEngine, StopStrategy};
pub use position_state::{PositionStateStore, Watermark};
