//! Queued requests and their completion handlers.

use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::client::PgResult;
use crate::error::Error;
use crate::protocol::types::{FormatCode, Oid};

/// Longest query text kept when the caller's copy is volatile.
pub const MAX_QUERY_LENGTH: usize = 2048;

/// Longest statement name kept when the caller's copy is volatile.
pub const MAX_NAME_LENGTH: usize = 512;

/// What a request asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Parse, bind and execute an unnamed statement
    Query,
    /// Parse a named statement
    Prepare,
    /// Bind and execute a named statement
    ExecutePrepared,
}

/// Ownership hints for [`Connection::enqueue`](crate::Connection::enqueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestFlags(u32);

impl RequestFlags {
    pub const NONE: Self = Self(0);
    /// Keep the query text as given instead of copying it
    pub const NON_VOLATILE_QUERY_STRING: Self = Self(1);
    /// Keep the statement name as given instead of copying it
    pub const NON_VOLATILE_NAME_STRING: Self = Self(2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for RequestFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Query text or statement name carried by a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlText(Cow<'static, str>);

impl SqlText {
    /// Keep `text` as given when `non_volatile`, otherwise take an owned copy
    /// of at most `limit` bytes, cut on a character boundary.
    pub fn new(text: Cow<'static, str>, non_volatile: bool, limit: usize) -> Self {
        if non_volatile {
            return Self(text);
        }
        let mut end = text.len().min(limit);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        Self(Cow::Owned(text[..end].to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the text is shared with the caller rather than copied.
    pub fn is_borrowed(&self) -> bool {
        matches!(self.0, Cow::Borrowed(_))
    }
}

/// Bind parameters: types, values (`None` is NULL) and format codes.
///
/// Values are reference counted, so copying a `Params` copies the arrays but
/// shares the bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    pub types: Vec<Oid>,
    pub values: Vec<Option<Arc<[u8]>>>,
    pub formats: Vec<FormatCode>,
}

impl Params {
    pub fn new(
        types: &[Oid],
        values: &[Option<Arc<[u8]>>],
        formats: &[FormatCode],
    ) -> Self {
        Self {
            types: types.to_vec(),
            values: values.to_vec(),
            formats: formats.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What a completion handler receives.
///
/// Failed requests carry an error; a server-side failure also keeps the raw
/// result so its error fields stay inspectable.
#[derive(Debug)]
pub struct Response {
    pub result: Option<PgResult>,
    pub error: Option<Error>,
}

impl Response {
    pub fn ok(result: PgResult) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: Error, result: Option<PgResult>) -> Self {
        Self { result, error: Some(error) }
    }

    pub fn into_result(self) -> Result<PgResult, Error> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, Some(result)) => Ok(result),
            (None, None) => Err(Error::Protocol("response without a result".into())),
        }
    }
}

/// Invoked exactly once with a request's outcome.
pub type Completion = Box<dyn FnOnce(Response)>;

/// A request waiting in the queue or in flight.
pub struct Request {
    pub kind: RequestKind,
    pub query: Option<SqlText>,
    pub name: Option<SqlText>,
    pub params: Params,
    pub flags: RequestFlags,
    pub(crate) completion: Completion,
}

impl Request {
    pub fn new(
        kind: RequestKind,
        query: Option<Cow<'static, str>>,
        name: Option<Cow<'static, str>>,
        params: &Params,
        flags: RequestFlags,
        completion: Completion,
    ) -> Self {
        Self {
            kind,
            query: query.map(|q| {
                SqlText::new(
                    q,
                    flags.contains(RequestFlags::NON_VOLATILE_QUERY_STRING),
                    MAX_QUERY_LENGTH,
                )
            }),
            name: name.map(|n| {
                SqlText::new(
                    n,
                    flags.contains(RequestFlags::NON_VOLATILE_NAME_STRING),
                    MAX_NAME_LENGTH,
                )
            }),
            params: params.clone(),
            flags,
            completion,
        }
    }

    /// Run the completion handler, consuming the request.
    pub fn complete(self, response: Response) {
        (self.completion)(response)
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("kind", &self.kind)
            .field("query", &self.query)
            .field("name", &self.name)
            .field("params", &self.params.len())
            .finish_non_exhaustive()
    }
}

/// Future side of [`pending`].
///
/// Resolves to [`Error::Cancelled`] if the completion is dropped without
/// being called, which is what a disconnect does.
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Pending<T> {
    /// Take the outcome if it has arrived, without an executor.
    pub fn try_take(&mut self) -> Option<Result<T, Error>> {
        match self.rx.try_recv() {
            Ok(value) => Some(Ok(value)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Cancelled)),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| Error::Cancelled))
    }
}

/// A completion closure paired with a future that yields what it was called with.
pub fn pending<T: 'static>() -> (Box<dyn FnOnce(T)>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    let complete = Box::new(move |value: T| {
        // The receiver may already be gone; nothing is waiting then.
        let _ = tx.send(value);
    });
    (complete, Pending { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volatile_text_is_copied_and_capped() {
        let long = "x".repeat(MAX_QUERY_LENGTH + 10);
        let text = SqlText::new(Cow::Owned(long), false, MAX_QUERY_LENGTH);
        assert_eq!(text.as_str().len(), MAX_QUERY_LENGTH);
        assert!(!text.is_borrowed());
    }

    #[test]
    fn test_cap_respects_char_boundary() {
        // 'é' is two bytes; a 3-byte cap must not split the second one.
        let text = SqlText::new(Cow::Borrowed("éé"), false, 3);
        assert_eq!(text.as_str(), "é");
    }

    #[test]
    fn test_non_volatile_text_is_kept() {
        let long: &'static str = Box::leak("y".repeat(MAX_NAME_LENGTH * 2).into_boxed_str());
        let text = SqlText::new(Cow::Borrowed(long), true, MAX_NAME_LENGTH);
        assert_eq!(text.as_str().len(), MAX_NAME_LENGTH * 2);
        assert!(text.is_borrowed());
    }

    #[test]
    fn test_params_share_values() {
        let value: Arc<[u8]> = Arc::from(&b"42"[..]);
        let params = Params::new(&[20], &[Some(Arc::clone(&value)), None], &[FormatCode::Text]);
        let copy = params.clone();
        assert_eq!(Arc::strong_count(&value), 3);
        assert_eq!(copy, params);
    }

    #[test]
    fn test_request_flags() {
        let flags = RequestFlags::NON_VOLATILE_QUERY_STRING | RequestFlags::NON_VOLATILE_NAME_STRING;
        assert!(flags.contains(RequestFlags::NON_VOLATILE_NAME_STRING));
        assert!(!RequestFlags::NONE.contains(RequestFlags::NON_VOLATILE_QUERY_STRING));
    }

    #[test]
    fn test_pending_try_take() {
        let (complete, mut pending) = pending::<u32>();
        assert!(pending.try_take().is_none());
        complete(7);
        assert_eq!(pending.try_take().unwrap().unwrap(), 7);
    }

    #[test]
    fn test_pending_dropped_is_cancelled() {
        let (complete, mut pending) = pending::<u32>();
        drop(complete);
        assert!(matches!(pending.try_take(), Some(Err(Error::Cancelled))));
    }

    #[tokio::test]
    async fn test_pending_await() {
        let (complete, pending) = pending::<&'static str>();
        complete("done");
        assert_eq!(pending.await.unwrap(), "done");
    }
}
