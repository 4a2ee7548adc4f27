pub mod channel;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod intake;
pub mod model;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod tracker;
