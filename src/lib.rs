#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate lazy_static;

pub mod blacklist;
pub mod crawler;
pub mod dataset;
pub mod dataset_writer;
pub mod extractor;
pub mod fetcher;
pub mod images;
pub mod retry;
pub mod runner;
pub mod source;
pub mod split;
pub mod types;
pub mod utils;
pub mod wikipedia;
