pub mod catalog;
pub mod quota;
pub mod recognition;
