pub mod idempotency_repository;
pub mod notification_repository;

pub use idempotency_repository::IdempotencyRepository;
pub use notification_repository::{NotificationFilter, NotificationRepository};
