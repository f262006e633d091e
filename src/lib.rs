pub mod archive;
pub mod cache;
pub mod cli;
pub mod config;
pub mod fetcher;
pub mod flock;
pub mod git;
pub mod integrity;
pub mod model;
pub mod npm;
pub mod pick;

mod api;

pub use api::{Pkgfetch, PkgfetchBuilder, TarballOutput};
