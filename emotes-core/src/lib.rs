mod catalog;
mod client;

pub use catalog::{RemoteEmote, RemoteSubreddit, Watermark};
pub use client::{CatalogClient, CatalogError, CatalogResult, decode_catalog};
