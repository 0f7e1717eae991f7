pub mod changes;
pub mod client;
pub mod models;

pub use changes::{CatalogChange, ChangePublisher};
pub use client::Catalog;
pub use models::*;
