pub mod actions;
pub mod board;
pub mod catalog;
pub mod controls;
pub mod integration;
pub mod model;
pub mod store;
pub mod timer;
pub mod treatment_text;
