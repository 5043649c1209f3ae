pub mod job;
pub mod remote;
pub mod settings;
