//! CLI Commands

pub mod backups;
pub mod confirm;
pub mod kb;
pub mod patch;
pub mod run;
