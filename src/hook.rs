//! Query hooks.
//!
//! Hooks observe every query a [`Db`](crate::Db), transaction or statement
//! runs. They see the query but cannot change it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::row::QueryResult;
use crate::types::Append;

/// What a hook sees about a query.
pub struct QueryEvent<'a> {
    /// The query template as passed by the caller.
    pub query: &'a str,
    pub params: &'a [&'a dyn Append],
    /// The SQL sent to the server, `None` for prepared statements and for
    /// templates that could not be formatted.
    pub formatted: Option<&'a str>,
    pub started_at: Instant,
    /// Set for `after_query` on success.
    pub result: Option<&'a QueryResult>,
    /// Set for `after_query` on failure.
    pub error: Option<&'a Error>,
    /// Attempts made, including retries. Zero in `before_query`.
    pub attempts: u32,
}

impl QueryEvent<'_> {
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl std::fmt::Debug for QueryEvent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEvent")
            .field("query", &self.query)
            .field("params", &self.params.len())
            .field("formatted", &self.formatted)
            .field("result", &self.result)
            .field("error", &self.error)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Observer of queries.
///
/// ```
/// use pgkit::{QueryEvent, QueryHook};
///
/// struct SlowQueryLog;
///
/// impl QueryHook for SlowQueryLog {
///     fn after_query(&self, event: &QueryEvent<'_>) {
///         if event.elapsed().as_secs() > 1 {
///             eprintln!("slow query: {}", event.query);
///         }
///     }
/// }
/// ```
pub trait QueryHook: Send + Sync {
    fn before_query(&self, _event: &QueryEvent<'_>) {}

    /// Runs after the last attempt, whether it failed or not.
    fn after_query(&self, _event: &QueryEvent<'_>) {}
}

/// Hook list shared by a `Db` and its clones. Adding a hook copies the list
/// when it is shared.
#[derive(Clone, Default)]
pub(crate) struct Hooks(Arc<Vec<Arc<dyn QueryHook>>>);

impl Hooks {
    pub(crate) fn add(&mut self, hook: Arc<dyn QueryHook>) {
        Arc::make_mut(&mut self.0).push(hook);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn before(&self, event: &QueryEvent<'_>) {
        for hook in self.0.iter() {
            hook.before_query(event);
        }
    }

    pub(crate) fn after(&self, event: &QueryEvent<'_>) {
        for hook in self.0.iter() {
            hook.after_query(event);
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hooks({})", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl QueryHook for Recorder {
        fn before_query(&self, event: &QueryEvent<'_>) {
            self.0.lock().push(format!("before {}", event.query));
        }

        fn after_query(&self, event: &QueryEvent<'_>) {
            self.0.lock().push(format!("after {} {}", event.query, event.error.is_some()));
        }
    }

    fn event<'a>(query: &'a str, error: Option<&'a Error>) -> QueryEvent<'a> {
        QueryEvent {
            query,
            params: &[],
            formatted: Some(query),
            started_at: Instant::now(),
            result: None,
            error,
            attempts: 1,
        }
    }

    #[test]
    fn test_hooks_run_in_order() {
        let recorder = Arc::new(Recorder::default());
        let mut hooks = Hooks::default();
        hooks.add(recorder.clone());

        hooks.before(&event("SELECT 1", None));
        hooks.after(&event("SELECT 1", Some(&Error::NoRows)));

        assert_eq!(
            *recorder.0.lock(),
            vec!["before SELECT 1".to_string(), "after SELECT 1 true".to_string()]
        );
    }

    #[test]
    fn test_add_copies_shared_list() {
        let mut root = Hooks::default();
        root.add(Arc::new(Recorder::default()));
        let clone = root.clone();

        root.add(Arc::new(Recorder::default()));
        assert_eq!(root.0.len(), 2);
        assert_eq!(clone.0.len(), 1);
    }
}
