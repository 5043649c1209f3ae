pub mod atomic;
pub mod client;
pub mod controller;
pub mod exporter;
pub mod reconcile;
pub mod store;
