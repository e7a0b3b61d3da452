// RevDB Engine - Core module structure
pub mod collate;
pub mod config;
pub mod database;
pub mod migrations;
pub mod store;
pub mod view;

pub use collate::Collation;
pub use config::StoreConfig;
pub use database::Database;
pub use store::RevisionStore;
pub use view::View;
