//! Human readable status lines for periodic logging.

use std::sync::Arc;

/// A long-running component that can describe its current load.
pub trait StatusReport: Send + Sync {
    fn status_line(&self) -> String;
}

impl<T: StatusReport + ?Sized> StatusReport for Arc<T> {
    fn status_line(&self) -> String {
        (**self).status_line()
    }
}

/// Joins the status lines of several components into one log line.
pub fn render(reports: &[Arc<dyn StatusReport>]) -> String {
    reports
        .iter()
        .map(|r| r.status_line())
        .collect::<Vec<_>>()
        .join(" | ")
}
