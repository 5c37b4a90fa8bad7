pub mod codes;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod normalize;
pub mod protocol;
pub mod provider;
pub mod request;
pub mod spot;
pub mod store;
pub mod template;

pub use codes::{ErrorCode, ProvCode, Registry, Severity};
pub use error::{BackendError, BackendErrorKind, BrokerError};
pub use gateway::Gateway;
pub use lifecycle::{Lifecycle, PollCycle, Timeouts, Transition};
pub use normalize::{Backend, NodeObservation, NodePhase};
pub use provider::{LaunchSpec, Launched, NodeProvider};
pub use request::{Machine, NodeResult, Request, RequestKind, RequestStatus};
pub use spot::{TerminationNotice, TerminationReason};
pub use store::{RequestGuard, RequestStore};
pub use template::{Template, TemplateCatalog};
