pub mod config;
pub mod document;
pub mod init;
pub mod session;
pub mod stage;
