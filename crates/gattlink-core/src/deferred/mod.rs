//! 异步结果
//!
//! - [`Deferred`]: 一次性结果（读、写、发现）
//! - [`ResultStream`]: 可多次发射的结果流（连接事件、通知）

pub mod promise;
pub mod stream;

pub use promise::{Deferred, Outcome, Promise, promise};
pub use stream::{ResultStream, StreamPromise, Subscription, result_stream};
