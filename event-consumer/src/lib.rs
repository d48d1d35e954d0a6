//! Consumers that apply HRIS events to the HR tables.

pub mod domain;
pub mod handlers;
pub mod models;
