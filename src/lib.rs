pub mod batch;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod hierarchy;
pub mod manifest;
pub mod output;
pub mod remote;
pub mod resolver;
pub mod table;
pub mod terms;
