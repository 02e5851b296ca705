pub mod config;
pub mod coordinator;
pub mod database;
pub mod heartbeat;
pub mod job;
pub mod notify;
pub mod oneshot;
pub mod parser;
pub mod queue;
pub mod recovery;
pub mod routes;
pub mod runner;
pub mod sandbox;
pub mod shared;
pub mod web_server;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
