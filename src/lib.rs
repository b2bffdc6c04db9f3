pub mod clock;
pub mod config;
pub mod error;
pub mod estimation;
pub mod feed;
pub mod state;
pub mod store;
