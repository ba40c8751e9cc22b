//! GitHub REST API access for signed-in sessions.

mod client;

pub use client::{
    Notification, NotificationRepository, NotificationSubject, NotificationsClient, SessionRejected,
};
