pub mod auth;
pub mod endorsement;
pub mod export;
pub mod history;
pub mod store;
pub mod workflow;
