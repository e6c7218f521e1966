//! A running download.
//!
//! The [`Coordinator`] wires the pieces together: links report what peers
//! have and send, the [`Scheduler`] picks which pieces to request next
//! (rarest first, with an end-game), the [`ChokeController`] decides every
//! tick which peers we upload to, and the [`UploadServicer`] answers their
//! requests through that gate.

mod choker;
mod coordinator;
mod registry;
mod scheduler;
mod upload;

pub use choker::{ChokeConfig, ChokeController, PeerClass, TickReport};
pub use coordinator::{Coordinator, Progress};
pub use registry::PeerRegistry;
pub use scheduler::{Assignment, Scheduler, SchedulerConfig};
pub use upload::{ServeOutcome, UploadRequest, UploadServicer};
