pub mod catalog;

pub use catalog::{CatalogApi, HttpCatalogClient, QueryOptions};
