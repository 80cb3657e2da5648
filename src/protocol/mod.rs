//! Blocking protocol seams the adapters drive
//!
//! Wire formats live in third-party clients; these traits are the narrow
//! surface the adapters need from them.

pub mod ftp;
pub mod smb;
