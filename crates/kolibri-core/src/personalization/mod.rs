//! Personalization: the on-device profiler, the empathy modulator, and the
//! federated aggregation primitives the self-learner builds on.

mod empathy;
mod federated;
mod profile;

pub use empathy::{EmpathyContext, EmpathyModulator};
pub use federated::{ModelUpdate, SecureAggregator};
pub use profile::{InteractionSignal, OnDeviceProfiler, UserProfile};
