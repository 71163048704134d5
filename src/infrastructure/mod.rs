pub mod config;
pub mod error;
pub mod event_mapper;
pub mod google_calendar_client;
pub mod oauth_client;
pub mod storage;
