//! Container log pipeline seen from the environment: a stream that tails
//! containers into its targets and a processor that replays one container's
//! lines into a classifier.

use std::marker::PhantomData;

use thiserror::Error;

use crate::{LogTarget, ScanError};

#[derive(Debug, Error)]
pub enum LogStreamError {
    #[error("no logs captured for container {0}")]
    ContainerNotFound(String),

    #[error("log stream error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl LogStreamError {
    pub fn internal<T>(value: T) -> Self
    where
        T: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        LogStreamError::Internal(value.into())
    }
}

#[derive(Debug, Error)]
pub enum LogProcessError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Stream(#[from] LogStreamError),
}

impl LogProcessError {
    /// True when the classifier flagged the logs, as opposed to the
    /// processing itself breaking.
    pub fn is_concerning(&self) -> bool {
        matches!(self, Self::Scan(x) if x.is_concerning())
    }
}

/// One captured log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogContent {
    pub container: String,
    pub content: String,
}

/// A running log stream.
///
/// Implementations serialize intake against readers: while
/// [`LogStream::process_container_logs`] runs no new lines are accepted, so
/// callers must not process containers concurrently.
pub trait LogStream: Send + Sync + 'static {
    /// Feeds every captured line of `container` to `f`, stopping at the
    /// first error it returns.
    fn process_container_logs(
        &self,
        container: &str,
        f: &mut dyn FnMut(&LogContent) -> Result<(), ScanError>,
    ) -> Result<(), LogProcessError>;

    fn flush_and_shutdown(&self) -> Result<(), LogStreamError>;

    /// Where each target keeps its output, for operator feedback.
    fn log_target_locations(&self) -> Vec<(LogTarget, String)>;

    fn save_log_location_in_test_summary(&self) -> Result<(), LogStreamError>;
}

/// A reader over a [`LogStream`] that threads an accumulator of type `T`
/// through the lines of a single container.
pub struct LogProcessor<'a, L: ?Sized, T> {
    stream: &'a L,
    _acc: PhantomData<T>,
}

impl<'a, L, T> LogProcessor<'a, L, T>
where
    L: LogStream + ?Sized,
    T: Default,
{
    pub fn new(stream: &'a L) -> Self {
        Self {
            stream,
            _acc: PhantomData,
        }
    }

    /// Returns the accumulator as left by the last line. Each call starts
    /// from `T::default()`.
    pub fn process_container_logs<F>(&self, container: &str, mut f: F) -> Result<T, LogProcessError>
    where
        F: FnMut(&LogContent, &mut T) -> Result<(), ScanError>,
    {
        let mut acc = T::default();

        self.stream
            .process_container_logs(container, &mut |line: &LogContent| f(line, &mut acc))?;

        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::LogLevel;

    struct Lines(Vec<LogContent>, Mutex<Vec<String>>);

    impl LogStream for Lines {
        fn process_container_logs(
            &self,
            container: &str,
            f: &mut dyn FnMut(&LogContent) -> Result<(), ScanError>,
        ) -> Result<(), LogProcessError> {
            self.1.lock().unwrap().push(container.to_owned());

            let mut found = false;

            for line in self.0.iter().filter(|x| x.container == container) {
                found = true;
                f(line)?;
            }

            if !found {
                return Err(LogStreamError::ContainerNotFound(container.to_owned()).into());
            }

            Ok(())
        }

        fn flush_and_shutdown(&self) -> Result<(), LogStreamError> {
            Ok(())
        }

        fn log_target_locations(&self) -> Vec<(LogTarget, String)> {
            vec![]
        }

        fn save_log_location_in_test_summary(&self) -> Result<(), LogStreamError> {
            Ok(())
        }
    }

    fn content(container: &str, content: &str) -> LogContent {
        LogContent {
            container: container.into(),
            content: content.into(),
        }
    }

    #[test]
    fn accumulates_per_container() {
        let stream = Lines(
            vec![
                content("a", "1"),
                content("b", "2"),
                content("a", "3"),
            ],
            Mutex::new(vec![]),
        );

        let processor = LogProcessor::<_, Vec<String>>::new(&stream);

        let seen = processor
            .process_container_logs("a", |line, acc| {
                acc.push(line.content.clone());
                Ok(())
            })
            .unwrap();

        assert_eq!(seen, vec!["1".to_string(), "3".to_string()]);
    }

    #[test]
    fn classifier_error_stops_processing() {
        let stream = Lines(
            vec![content("a", "1"), content("a", "2")],
            Mutex::new(vec![]),
        );

        let processor = LogProcessor::<_, usize>::new(&stream);

        let err = processor
            .process_container_logs("a", |line, count| {
                *count += 1;
                Err(ScanError::OneAtLevel {
                    level: LogLevel::Panic,
                    line: line.content.clone(),
                })
            })
            .unwrap_err();

        assert!(err.is_concerning());
        assert!(matches!(
            err,
            LogProcessError::Scan(ScanError::OneAtLevel { line, .. }) if line == "1"
        ));
    }

    #[test]
    fn missing_container_is_not_concerning() {
        let stream = Lines(vec![], Mutex::new(vec![]));

        let processor = LogProcessor::<_, usize>::new(&stream);
        let err = processor
            .process_container_logs("ghost", |_, _| Ok(()))
            .unwrap_err();

        assert!(!err.is_concerning());
        assert_eq!(*stream.1.lock().unwrap(), vec!["ghost".to_string()]);
    }
}
