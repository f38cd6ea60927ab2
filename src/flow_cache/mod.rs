pub mod cache;
pub mod capture;
mod error;
mod export;
mod node;
mod partition;
mod queue;
mod tcp;

pub use cache::{FlowCache, FlowCacheCounter};
pub use capture::{CaptureBuffer, PayloadSegment};
pub use error::{Error, Result};
pub use export::{AppLabeler, FlowExporter, PacketDumper};
