//! VM records, templates, and the lifecycle state machine.

mod lifecycle;
mod manager;
mod state;
pub mod template;

pub use lifecycle::{CreateVmRequest, LifecycleManager, VmStatus};
pub use manager::VmManager;
pub use state::{VmRecord, VmState};
pub use template::{Template, TemplateStore};
