//! Readout of a detector crate over a PCIe transceiver: DMA acquisition into a
//! lock-free block queue, event framing into rotating raw files, trigger and
//! PPS side loops, and a counter snapshot for monitoring.

pub mod config;
pub mod dma;
pub mod error;
pub mod metrics;
pub mod pcie;
pub mod pps;
pub mod queue;
pub mod rt;
pub mod run;
pub mod sim;
pub mod trigger;
pub mod tui;
pub mod writer;

pub use config::*;
pub use dma::*;
pub use error::*;
pub use metrics::*;
pub use pcie::*;
pub use pps::*;
pub use queue::*;
pub use rt::*;
pub use run::*;
pub use sim::*;
pub use trigger::*;
pub use tui::*;
pub use writer::*;
