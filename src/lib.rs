pub mod channel;
pub mod config;
pub mod directory;
pub mod message;
pub mod port;
pub mod protocol;
pub mod service;
pub mod session;
pub mod supervisor;
pub mod worker;
