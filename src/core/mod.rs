pub mod downloader;
pub mod error;
pub mod events;
pub mod model;
