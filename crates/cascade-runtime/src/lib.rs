pub mod config;
pub mod driver;
pub mod notify;
pub mod repository;
pub mod state;
pub mod sweeper;

pub use config::RuntimeConfig;
pub use driver::{DriverConfig, InstanceContext, PersistentDriver, SignalOutcome};
pub use notify::{NoOpNotifier, SignalNotificationService};
pub use repository::{InMemoryStateRepository, StateRepository};
pub use state::{InstanceState, InstanceStatus};
pub use sweeper::{SweeperConfig, TimeoutSweeper};
