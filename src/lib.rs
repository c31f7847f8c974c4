// src/lib.rs

pub mod types;
pub mod storage;
pub mod assembly;
pub mod ledger;
pub mod reconcile;
pub mod identity;
pub mod network;
pub mod handlers;
pub mod client;
pub mod gateway;
pub mod sync;
pub mod seeds;
pub mod config;
pub mod node;
