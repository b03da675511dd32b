pub mod conversation;
pub mod document;
pub mod operation;
pub mod usage;
