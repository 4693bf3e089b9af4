use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

/// Observes the lifecycle of analytic queries, keyed by request id.
pub trait QueryLogger: Send + Sync {
    fn accept_query(&self, request_id: Uuid, query: &str);

    fn process_query(&self, request_id: Uuid, sql: &str);

    fn cancel_query(&self, request_id: Uuid);

    fn complete_query(&self, request_id: Uuid, rows: usize, elapsed: Duration);
}

#[derive(Debug, Default)]
pub struct NoopQueryLogger;

impl QueryLogger for NoopQueryLogger {
    fn accept_query(&self, _: Uuid, _: &str) {}

    fn process_query(&self, _: Uuid, _: &str) {}

    fn cancel_query(&self, _: Uuid) {}

    fn complete_query(&self, _: Uuid, _: usize, _: Duration) {}
}

#[derive(Debug, Default)]
pub struct TracingQueryLogger;

impl QueryLogger for TracingQueryLogger {
    fn accept_query(&self, request_id: Uuid, query: &str) {
        debug!(request_id = %request_id, query, "query accepted");
    }

    fn process_query(&self, request_id: Uuid, sql: &str) {
        debug!(request_id = %request_id, sql, "query processing");
    }

    fn cancel_query(&self, request_id: Uuid) {
        info!(request_id = %request_id, "query cancelled");
    }

    fn complete_query(&self, request_id: Uuid, rows: usize, elapsed: Duration) {
        info!(
            request_id = %request_id,
            rows,
            elapsed = ?elapsed,
            "query completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_logger_accepts_any_duration() {
        let logger = TracingQueryLogger;
        let request_id = Uuid::new_v4();
        logger.accept_query(request_id, "playerStats");
        logger.process_query(request_id, "SELECT 1");
        logger.complete_query(request_id, 0, Duration::MAX);
        logger.cancel_query(request_id);
    }
}
