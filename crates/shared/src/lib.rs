pub mod conversation;
pub mod domain;
pub mod error;
pub mod protocol;
