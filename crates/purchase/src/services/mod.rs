//! External collaborators of the purchase flow and their adapters.

pub mod fulfillment;
pub mod notification;

pub use fulfillment::{
    FulfillmentProvider, FulfillmentReceipt, FulfillmentRequest, HttpFulfillmentProvider,
    InMemoryFulfillmentProvider,
};
pub use notification::{
    InMemoryNotificationSink, NotificationSink, NotificationStatus, PurchaseNotification,
    TracingNotificationSink,
};
