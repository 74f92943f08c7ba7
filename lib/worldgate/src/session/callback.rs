use crate::db::{PendingQuery, QueryResult};
use crate::session::Session;

pub type CallbackFn = fn(&Session, u64, QueryResult);

/// One deferred database continuation: the in-flight query, an opaque
/// parameter captured at submission and the function to run on completion.
pub struct QueryCallback {
    query: PendingQuery,
    param: u64,
    callback: CallbackFn,
}

impl QueryCallback {
    pub fn new(query: PendingQuery, param: u64, callback: CallbackFn) -> QueryCallback {
        QueryCallback {
            query,
            param,
            callback,
        }
    }

    /// Polls the query. Returns the invocation parts once ready.
    #[inline]
    pub fn poll(&self) -> Option<(CallbackFn, u64, QueryResult)> {
        self.query
            .poll()
            .map(|result| (self.callback, self.param, result))
    }
}
