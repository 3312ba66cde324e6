//! Configuration and domain types shared by the indent client and CLI.

pub mod config;
pub mod models;
