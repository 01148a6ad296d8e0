pub mod archive;
pub mod config;
pub mod decoder;
pub mod download;
pub mod error;
pub mod filter;
pub mod fleet;
pub mod fs_util;
pub mod job;
pub mod output;
pub mod parse;
pub mod preview;
pub mod progress;
pub mod request;
pub mod resolver;
pub mod sftp;
pub mod storage;
pub mod timeutil;
pub mod workspace;
