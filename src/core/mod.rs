pub mod broker;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod customer;
pub mod errors;
pub mod event;
pub mod monitor;
pub mod production;
pub mod shutdown;
pub mod supervisor;
pub mod types;
