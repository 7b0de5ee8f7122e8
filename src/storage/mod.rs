//! Durable storage paths and setup

pub mod layout;
