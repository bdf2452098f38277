//! The log streaming fabric: replay buffer, per-pod log stream, log hub,
//! per-app merged stream, and the app-stream pool.

mod app_stream;
mod hub;
mod lock;
mod log_stream;
mod parser;
mod pool;
mod replay;
mod subscriber;

pub use app_stream::AppStream;
pub use hub::{LogHub, PodDetach};
pub use log_stream::LogStream;
pub use pool::{AppDetach, AppStreamPool};
pub use replay::ReplayBuffer;
pub use subscriber::{broadcast, new_subscriber, Subscriber};
