use std::future::Future;
use std::time::Duration;

use crate::error::AppError;

/// Key-value/list/hash/set primitives the job queue is written against.
///
/// The layout mirrors Redis so that a Redis server can back the queue
/// directly, but any store that provides these operations with the same
/// atomicity works.
///
/// Implementations must guarantee that [`blpop`](Self::blpop) is atomic:
/// a popped value is handed to exactly one caller.
pub trait SharedStore: Send + Sync + Clone {
    fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn hget(
        &self,
        key: &str,
        field: &str,
    ) -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    /// Returns true if the field existed.
    fn hdel(&self, key: &str, field: &str) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn hgetall(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Vec<(String, String)>, AppError>> + Send;

    /// Append to the tail of a list.
    fn rpush(&self, key: &str, value: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Remove every occurrence of `value`. Returns the number removed.
    fn lrem(&self, key: &str, value: &str) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn llen(&self, key: &str) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Pop the head of the first non-empty list, checking `keys` in order.
    ///
    /// Blocks up to `timeout` when every list is empty and returns `None`
    /// if nothing arrives. A zero timeout performs a single non-blocking sweep.
    fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<(String, String)>, AppError>> + Send;

    fn sadd(&self, key: &str, member: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Returns true if the member was present.
    fn srem(&self, key: &str, member: &str) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn smembers(&self, key: &str) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;
}
