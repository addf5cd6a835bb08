pub mod auth;
pub mod capture;
pub mod content;
pub mod export;
pub mod guides;
pub mod jobs;
pub mod sharing;
pub mod synthesis;
pub mod uploads;
