pub mod client;
pub mod config;
pub mod coordinator;
pub mod deadline;
pub mod framing;
pub mod listener;
pub mod logging;
pub mod outbox;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod status;
