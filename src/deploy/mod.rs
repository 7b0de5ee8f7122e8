//! Deployment module

pub mod cloud;
pub mod config;
pub mod docker;
pub mod driver;
pub mod fsm;
pub mod local;
pub mod orchestrator;
pub mod process;
pub mod static_site;
