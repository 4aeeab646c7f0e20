pub mod job;
pub mod photo;
pub mod search;
