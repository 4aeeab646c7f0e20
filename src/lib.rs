//! Face photo search
//!
//! This library provides the core functionality for the face-search system,
//! which accepts a photo of a face and asynchronously searches a remote photo
//! corpus for every photo containing that person. Jobs are persisted in
//! PostgreSQL and processed by one or more worker processes.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
