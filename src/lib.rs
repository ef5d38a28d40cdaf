// Library interface for latticepaint
// Tests and the CLI drive the painting, search and transaction pieces through here.

pub mod config;
pub mod graph;
pub mod painting;
pub mod report;
pub mod sizer;
pub mod scaffold;
pub mod protocol;
pub mod approximate;
pub mod simulator;
pub mod metrics;

pub use graph::{StarForest, StarTree};
pub use painting::{Asset, CryptoContext, MatchStatus, Painting, Vertex};
pub use protocol::{Approximation, Multiplexer};
pub use approximate::{ApproximatorHandle, PaintingApproximator, SearchState};
pub use report::TransactionReport;
pub use sizer::{FeeSchedule, TransactionWriter};
