//! cacp - a peer-replicated coordination agent for cross-repository contract negotiation

pub mod agent;
pub mod broadcast;
pub mod collab;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod files;
pub mod models;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod store;
pub mod validation;
pub mod workflow;
