//! KVFinder-web job client
//!
//! This library submits cavity detection jobs to a KVFinder-web service,
//! keeps a persisted local record of each job, polls the service in the
//! background and exports finished results as parKVFinder-style files.

pub mod app_state;
pub mod config;
pub mod models;
pub mod services;
