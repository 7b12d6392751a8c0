pub mod clear;
pub mod daemon;
pub mod init;
pub mod lookup;
pub mod report;
pub mod sync;
