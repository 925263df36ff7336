pub mod auth;
pub mod dashboard;
pub mod groups;
pub mod keys;
pub mod logs;
pub mod settings;
