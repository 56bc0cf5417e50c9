pub mod app;
pub mod cancel;
pub mod config;
pub mod credentials;
pub mod domain;
pub mod downloader;
pub mod error;
pub mod form_source;
pub mod fs_util;
pub mod http;
pub mod output;
pub mod progress;
pub mod reconcile;
pub mod repository;
pub mod store;
pub mod submit;
pub mod task;
pub mod upload;
