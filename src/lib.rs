pub mod agent;
pub mod config;
pub mod error;
pub mod jobs;
pub mod liveness;
pub mod logging;
pub mod protocol;
pub mod signals;
pub mod tls;
pub mod transport;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::{AgentError, Result};
