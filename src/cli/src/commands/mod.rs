pub mod dispatch;
pub mod jobs;
pub mod worker;
