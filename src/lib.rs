//! HTTP service that downloads online videos or their audio track through
//! yt-dlp, either synchronously or as background jobs with pollable progress.

pub mod config;
pub mod error;
pub mod extractor;
pub mod files;
pub mod jobs;
pub mod routes;
pub mod server;
pub mod state;
