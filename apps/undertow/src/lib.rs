pub mod config;
pub mod connection;
pub mod dom;
pub mod effect;
pub mod events;
pub mod metrics;
pub mod optimistic;
pub mod protocol;
pub mod renderer;
pub mod server;
pub mod sync;
pub mod telemetry;
pub mod terminal;
pub mod transport;
