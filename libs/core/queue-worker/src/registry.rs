//! Queue definitions.

/// Queue definition trait.
///
/// Each domain names its work queue and the dead-letter queue that
/// receives malformed or exhausted messages.
///
/// # Example
///
/// ```rust,ignore
/// use queue_worker::QueueDef;
///
/// pub struct CompanyListQueue;
///
/// impl QueueDef for CompanyListQueue {
///     const QUEUE_NAME: &'static str = "jobs.company-list";
///     const DLQ_NAME: &'static str = "jobs.company-list.dlq";
/// }
/// ```
pub trait QueueDef: Send + Sync {
    /// The work queue name.
    const QUEUE_NAME: &'static str;

    /// The dead letter queue name.
    const DLQ_NAME: &'static str;

    fn queue_name() -> &'static str {
        Self::QUEUE_NAME
    }

    fn dlq_name() -> &'static str {
        Self::DLQ_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestQueue;
    impl QueueDef for TestQueue {
        const QUEUE_NAME: &'static str = "test.queue";
        const DLQ_NAME: &'static str = "test.queue.dlq";
    }

    #[test]
    fn test_queue_def() {
        assert_eq!(TestQueue::queue_name(), "test.queue");
        assert_eq!(TestQueue::dlq_name(), "test.queue.dlq");
    }
}
