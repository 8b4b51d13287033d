pub mod fetcher;
pub mod writer;
