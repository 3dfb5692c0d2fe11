pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod geo;
pub mod session;
pub mod storage;
pub mod user_agent;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::AnalyticsError;
pub use event_bus::{AnalyticsEvent, AnalyticsEventType, EventBus};
pub use geo::{GeoChain, GeoLocation, GeoProvider};
pub use session::{PageEnvironment, VisitorSession};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use user_agent::DeviceClass;
