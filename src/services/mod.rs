pub mod callbacks;
pub mod collaborators;
pub mod deliveries;
pub mod eligibility;
pub mod init;
pub mod pipeline;
pub mod providers;
pub mod quiet_hours;
pub mod reconciler;
pub mod retry;
pub mod status_feed;
