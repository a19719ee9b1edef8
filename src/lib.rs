pub mod app;
pub mod catalog;
pub mod config;
pub mod content;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod fs_util;
pub mod ingredients;
pub mod keys;
pub mod output;
pub mod package;
pub mod remote;
pub mod resolver;
pub mod store;
pub mod workspace;
