pub mod attendance;
pub mod core;
pub mod directory;
pub mod pickup;
pub mod scans;
pub mod schedule;
