//! Adapters shipped with the binary.

pub mod external;
pub mod heartbeat;

pub use external::ExternalAdapter;
pub use heartbeat::HeartbeatAdapter;

use crate::director::WorkerDirector;

pub fn register_builtin(director: &mut WorkerDirector) {
    director.register_adapter(HeartbeatAdapter);
    director.register_adapter(ExternalAdapter);
}
