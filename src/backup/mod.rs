pub mod compress;
pub mod config;
pub mod encrypt;
pub mod finish;
pub mod result_error;
pub mod schedule;
pub mod secret;
pub mod session;
pub mod source;
pub mod storage;
pub mod store;
pub mod transfer;
pub mod validate;
