//! Stream event protocol: the tagged `StreamPart` union shared by the agent's
//! guardrail loop and the eval engine's event stream.

pub mod event;

pub use event::StreamPart;
