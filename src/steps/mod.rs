pub mod copy;
pub mod extract;
pub mod mount;
pub mod select;
pub mod service;
pub mod unit;
