//! Fire-and-forget notifications about order and subscription events.

mod dispatcher;
mod events;
mod handle;

pub use dispatcher::{
    create_notification_system, LogNotifier, NotificationDispatcher, Notifier, NotifyError,
};
pub use events::{Notification, NotificationKind};
pub use handle::NotificationHandle;
