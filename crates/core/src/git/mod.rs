//! Git operations on group mirrors.

pub mod client;
pub mod remote_url;

pub use client::{MergeComputation, RemoteRepository, TagInfo};
