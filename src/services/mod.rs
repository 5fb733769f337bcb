pub mod billing;
pub mod dispatcher;
pub mod mirror;
pub mod queue_drainer;
pub mod rate_limiter;
pub mod scheduler;
pub mod status_reporter;
pub mod wallet_ledger;

pub use billing::{BillingService, TopUp};
pub use dispatcher::{DispatchError, DispatchOutcome, DispatchSettings, Dispatcher, FailureReason};
pub use mirror::{MirrorReport, WalletMirror, WalletMirrorJob};
pub use queue_drainer::{DrainReport, QueueDrainer};
pub use rate_limiter::{MemoryCounter, RateCounter, RateLimiter, RateLimits, RedisCounter};
pub use scheduler::{Job, JobScheduler, JobStatus};
pub use status_reporter::{ReportJob, ReporterHandle, ReporterInbox, RetryPolicy, StatusReporter};
pub use wallet_ledger::{Charge, WalletLedger};
