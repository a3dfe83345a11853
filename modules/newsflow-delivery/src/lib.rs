pub mod dispatcher;
pub mod error;
pub mod jobs;
pub mod lock;
pub mod planner;
pub mod registry;
pub mod render;
pub mod sender;
pub mod sources;
pub mod usage;
pub mod validate;

pub use dispatcher::{Dispatcher, PollOutcome};
pub use error::{DeliveryError, Result, SendError};
pub use jobs::JobStore;
pub use lock::{DistributedLock, PgLeaseLock};
pub use planner::DeliveryPlanner;
pub use registry::{NewWebhook, Webhook, WebhookRegistry, WebhookUpdate};
pub use sender::{EmailSender, HttpsSender, Mailer, PlatformSender, SenderTable, TelegramSender};
pub use sources::SourceStore;
pub use usage::UsageAccounting;
pub use validate::TargetValidator;
