//! Job scheduling and worker coordination.

pub mod dispatcher;
pub mod gate;
pub mod janitor;
pub mod registry;
pub mod sweep;

pub use dispatcher::Dispatcher;
pub use gate::{AlwaysAdmit, ClaimGate, NeverAdmit, ProbabilisticGate};
pub use janitor::JanitorRegistry;
pub use registry::{WorkerRegistry, generate_api_key};
pub use sweep::spawn_sweep_ticker;
