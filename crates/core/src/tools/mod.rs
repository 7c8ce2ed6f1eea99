//! Small shared services: token issuance and interdomain name handling.

pub mod interdomain;
pub mod token;
