pub mod application;
pub mod domain;
pub mod interfaces;
pub mod protocol;
pub mod recovery;
pub mod scheduler;
pub mod security;
pub mod sessions;
pub mod store;
