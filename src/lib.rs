pub mod boot;
pub mod config;
pub mod export;
pub mod record;
pub mod remote;
pub mod storage;
pub mod stream;
