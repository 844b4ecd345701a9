//! Resume handler: the reactor-side end of the channel.
//!
//! Invoked when the read end is readable. Drains every complete handle
//! (one edge can stand for many finished workers), turns each back into a
//! live request through the host, and finalizes it. Nothing here blocks.

use handoff_core::error::ReadError;
use handoff_core::handle::HandleValue;
use handoff_core::host::{RequestHost, Respond};
use handoff_core::sink::ChannelHealth;
use handoff_module::ReadEnd;

use std::fmt;
use std::ops::AddAssign;

/// What one drain pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeReport {
    /// Handles reclaimed and finalized.
    pub finalized: usize,
    /// Unknown, stale, or duplicate handles dropped.
    pub discarded: usize,
    /// Reclaimed, but the host refused to finalize.
    pub failed: usize,
}

impl ResumeReport {
    pub fn delivered(&self) -> usize {
        self.finalized + self.discarded + self.failed
    }
}

impl AddAssign for ResumeReport {
    fn add_assign(&mut self, rhs: Self) {
        self.finalized += rhs.finalized;
        self.discarded += rhs.discarded;
        self.failed += rhs.failed;
    }
}

/// A drain pass that ended on a transport error. `report` still counts
/// everything the pass finalized before the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeError {
    pub report: ResumeReport,
    pub error: ReadError,
}

impl fmt::Display for ResumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after {} finalized", self.error, self.report.finalized)
    }
}

impl std::error::Error for ResumeError {}

pub struct ResumeHandler<H, R> {
    read_end: ReadEnd,
    host: H,
    responder: R,
    health: ChannelHealth,
    totals: ResumeReport,
}

impl<H: RequestHost, R: Respond> ResumeHandler<H, R> {
    pub fn new(read_end: ReadEnd, host: H, responder: R, health: ChannelHealth) -> Self {
        Self {
            read_end,
            host,
            responder,
            health,
            totals: ResumeReport::default(),
        }
    }

    /// Drain the channel and finalize everything on it.
    ///
    /// A transport error marks the channel degraded and is returned along
    /// with the report of the handles finalized before it.
    pub fn on_readable(&mut self) -> Result<ResumeReport, ResumeError> {
        let mut report = ResumeReport::default();
        let result = loop {
            match self.read_end.read_handle() {
                Ok(Some(value)) => self.resume(value, &mut report),
                Ok(None) => break Ok(report),
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        partial = self.read_end.partial(),
                        "channel read failed"
                    );
                    if self.health.degrade() {
                        tracing::error!("deferred completion unavailable until restart");
                    }
                    break Err(ResumeError { report, error: e });
                }
            }
        };
        self.totals += report;
        if report.delivered() > 0 {
            tracing::trace!(?report, "drain pass");
        }
        result
    }

    fn resume(&mut self, value: HandleValue, report: &mut ResumeReport) {
        let Some(handle) = self.host.reclaim(value) else {
            tracing::warn!(handle = %value, "discarding unknown or duplicate handle");
            report.discarded += 1;
            return;
        };

        let response = self.responder.respond(&handle);
        let status = response.status;
        match self.host.finalize(handle, response) {
            Ok(()) => {
                tracing::debug!(handle = %value, status, "request resumed");
                report.finalized += 1;
            }
            Err(e) => {
                tracing::warn!(handle = %value, error = %e, "finalize refused");
                report.failed += 1;
            }
        }
    }

    /// Totals across every pass so far.
    pub fn totals(&self) -> ResumeReport {
        self.totals
    }

    pub fn health(&self) -> &ChannelHealth {
        &self.health
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handoff_core::handle::RequestHandle;
    use handoff_core::host::{Response, StaticResponse};
    use handoff_core::sink::HandleSink;
    use handoff_module::{channel, RequestTable};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn setup() -> (
        handoff_module::WriteEnd,
        ResumeHandler<Rc<RefCell<RequestTable>>, StaticResponse>,
        Rc<RefCell<RequestTable>>,
    ) {
        let (w, r) = channel(Duration::from_millis(100)).unwrap();
        let table = Rc::new(RefCell::new(RequestTable::with_log(64)));
        let handler = ResumeHandler::new(
            r,
            Rc::clone(&table),
            StaticResponse(Response::text(200, "hello\n")),
            ChannelHealth::new(),
        );
        (w, handler, table)
    }

    fn deferred(table: &Rc<RefCell<RequestTable>>) -> HandleValue {
        let mut t = table.borrow_mut();
        let h = t.admit(());
        t.suspend(&h).unwrap();
        h.into_raw()
    }

    #[test]
    fn empty_channel_is_a_noop() {
        let (_w, mut handler, _table) = setup();
        assert_eq!(handler.on_readable().unwrap(), ResumeReport::default());
    }

    #[test]
    fn drains_in_write_order() {
        let (w, mut handler, table) = setup();
        let values: Vec<_> = (0..5).map(|_| deferred(&table)).collect();
        for v in &values {
            w.write_value(*v).unwrap();
        }

        let report = handler.on_readable().unwrap();
        assert_eq!(report.finalized, 5);
        let order: Vec<_> = table
            .borrow_mut()
            .take_finalized()
            .into_iter()
            .map(|f| f.handle)
            .collect();
        assert_eq!(order, values);
    }

    #[test]
    fn duplicate_is_discarded() {
        let (w, mut handler, table) = setup();
        let v = deferred(&table);
        w.write_value(v).unwrap();
        w.write_value(v).unwrap();

        let report = handler.on_readable().unwrap();
        assert_eq!(report, ResumeReport { finalized: 1, discarded: 1, failed: 0 });
        assert_eq!(table.borrow_mut().take_finalized().len(), 1);
    }

    #[test]
    fn unknown_value_is_discarded() {
        let (w, mut handler, _table) = setup();
        w.write_value(HandleValue::new(99, 4)).unwrap();
        assert_eq!(handler.on_readable().unwrap().discarded, 1);
    }

    #[test]
    fn closed_writer_degrades() {
        let (w, mut handler, table) = setup();
        let v = deferred(&table);
        w.write_handle(RequestHandle::from_raw(v)).unwrap();
        drop(w);

        // The frame written before close still comes through first, and
        // the failing pass reports it.
        let err = handler.on_readable().unwrap_err();
        assert_eq!(err.error, ReadError::Closed);
        assert_eq!(err.report, ResumeReport { finalized: 1, discarded: 0, failed: 0 });
        assert!(handler.health().is_degraded());
        assert_eq!(handler.totals().finalized, 1);
        assert_eq!(table.borrow_mut().take_finalized().len(), 1);
    }
}
