pub mod cache;
pub mod cli;
pub mod codes;
pub mod config;
pub mod console;
pub mod consts;
pub mod fileutil;
pub mod judge;
pub mod process;
pub mod results;
pub mod summary;
pub mod targets;
pub mod taskgraph;
