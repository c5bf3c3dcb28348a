//! Database models split into separate files.

pub mod attachment;
pub mod content;
pub mod history;
pub mod idempotency;
pub mod notification;

pub use self::attachment::*;
pub use self::content::*;
pub use self::history::*;
pub use self::idempotency::*;
pub use self::notification::*;
