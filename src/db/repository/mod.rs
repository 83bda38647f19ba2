pub mod account_directory;
pub mod delivery_record_repository;
pub mod delivery_status_log_repository;
pub mod notification_event_repository;

pub use account_directory::SqliteAccountDirectory;
pub use delivery_record_repository::DeliveryRecordRepository;
pub use delivery_status_log_repository::DeliveryStatusLogRepository;
pub use notification_event_repository::NotificationEventRepository;
