//! Host-side request API.
//!
//! The host owns request state; the deferred path only ever moves the
//! handle around. Everything here runs on the reactor thread.

use crate::handle::{HandleValue, RequestHandle};

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// What a content handler tells the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    /// Response already produced.
    Done,
    /// Response will come later; keep the request open.
    Deferred,
}

/// A response ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    pub fn text(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status, "text/plain", body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// No live request for this handle.
    Unknown(HandleValue),
    /// Request exists but is not in the state the call needs.
    NotActive(HandleValue),
    /// The connection behind the request is gone.
    Gone(HandleValue),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(h) => write!(f, "unknown request {}", h),
            Self::NotActive(h) => write!(f, "request {} not in expected state", h),
            Self::Gone(h) => write!(f, "request {} lost its connection", h),
        }
    }
}

impl std::error::Error for HostError {}

/// The host's request table as seen by the deferred path.
pub trait RequestHost {
    /// Mark the request as waiting on a worker.
    fn suspend(&mut self, handle: &RequestHandle) -> Result<(), HostError>;

    /// Turn a delivered value back into a handle.
    ///
    /// `None` when the slot is empty, the generation is stale, or the
    /// request is not suspended (duplicate delivery).
    fn reclaim(&mut self, value: HandleValue) -> Option<RequestHandle>;

    /// Send `response` and retire the request.
    fn finalize(&mut self, handle: RequestHandle, response: Response) -> Result<(), HostError>;
}

impl<H: RequestHost + ?Sized> RequestHost for Rc<RefCell<H>> {
    fn suspend(&mut self, handle: &RequestHandle) -> Result<(), HostError> {
        self.borrow_mut().suspend(handle)
    }

    fn reclaim(&mut self, value: HandleValue) -> Option<RequestHandle> {
        self.borrow_mut().reclaim(value)
    }

    fn finalize(&mut self, handle: RequestHandle, response: Response) -> Result<(), HostError> {
        self.borrow_mut().finalize(handle, response)
    }
}

/// Builds the response for a resumed request.
pub trait Respond {
    fn respond(&mut self, handle: &RequestHandle) -> Response;
}

impl<F> Respond for F
where
    F: FnMut(&RequestHandle) -> Response,
{
    fn respond(&mut self, handle: &RequestHandle) -> Response {
        self(handle)
    }
}

/// Same response for every request.
#[derive(Debug, Clone)]
pub struct StaticResponse(pub Response);

impl Respond for StaticResponse {
    fn respond(&mut self, _handle: &RequestHandle) -> Response {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_response() {
        let r = Response::text(200, "hello\n");
        assert_eq!(r.status, 200);
        assert_eq!(r.content_type, "text/plain");
        assert_eq!(r.body, b"hello\n");
    }

    #[test]
    fn closures_respond() {
        let mut seen = Vec::new();
        let mut responder = |h: &RequestHandle| {
            seen.push(h.value());
            Response::text(200, "ok")
        };
        let h = RequestHandle::from_raw(HandleValue::new(3, 1));
        assert_eq!(responder.respond(&h).body, b"ok");
        drop(responder);
        assert_eq!(seen, vec![HandleValue::new(3, 1)]);
    }
}
