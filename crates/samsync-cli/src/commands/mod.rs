pub mod accounts;
pub mod schedule;
pub mod status;
pub mod sync;
