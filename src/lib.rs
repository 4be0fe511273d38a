pub mod alarm;
pub mod cache;
pub mod cleaner;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod intake;
pub mod params;
pub mod store;

pub use alarm::{AlarmEvent, AlarmSink, LogAlarmSink};
pub use config::CoordinatorConfig;
pub use controller::NamespaceController;
pub use engine::{EngineState, ShardingEngine};
pub use error::{CoordinationError, Result};
pub use intake::ShardingEvent;
pub use store::memory::MemoryStore;
pub use store::CoordinationStore;
