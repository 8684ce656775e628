//! Host persistence contracts.

pub mod layout;
