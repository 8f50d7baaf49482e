pub mod producer;
pub mod loader;
pub mod mixer;
pub mod pubsub;

pub use producer::{DataProducer, PriceEvent, Provider};
pub use loader::{DataLoader, LoadError, ReplayProvider};
pub use mixer::mix;
pub use pubsub::{Hub, HubConfig, HubHandle, HubStats, Lane, LaneId, LaneReceiver};
