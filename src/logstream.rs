use std::sync::Arc;

use testenv_core::{
    scan::scan_log_line, LogProcessor, LogScanSettings, LogStream, LogTarget, Platform,
    TestHandle,
};
use tracing::{debug, error, info};

use crate::{EnvError, TestEnvHandle};

impl<P: Platform> TestEnvHandle<P> {
    /// Starts the log stream. Scanning reads node logs back from disk, so an
    /// active `scan` forces the file target on.
    pub(crate) fn start_log_stream(&self, scan: Option<&LogScanSettings>) -> Result<(), EnvError> {
        let mut env = self.lock();

        let scanning = scan.is_some_and(LogScanSettings::is_enabled);
        let targets = &mut env.test_config.logging.log_stream.log_targets;

        if scanning && !targets.contains(&LogTarget::File) {
            debug!("enabling logging to file in order to support node log scanning");
            targets.push(LogTarget::File);
        }

        let stream = env
            .platform()
            .new_log_stream(env.test_name.as_deref(), &env.test_config.logging)?;

        env.log_stream = Some(Arc::new(stream));

        Ok(())
    }
}

/// Shuts the log stream down at the end of a test: scans node logs for
/// concerning lines, then flushes them out if the test failed or logs were
/// asked for.
pub(crate) struct LogStreamTeardown<P: Platform> {
    pub env: TestEnvHandle<P>,
    pub scan: Option<LogScanSettings>,
    pub node_count: usize,
}

impl<P: Platform> LogStreamTeardown<P> {
    pub fn run(self, test: &dyn TestHandle) {
        info!("shutting down log stream");

        if let Ok(path) = std::env::current_dir().map(|x| x.join("logs")) {
            info!(path = %path.display(), "log stream logs folder location");
        }

        let (stream, node_containers, test_log_collect) = {
            let env = self.env.lock();

            (
                env.log_stream.clone(),
                env.node_containers().to_vec(),
                env.test_config.logging.test_log_collect,
            )
        };

        let Some(stream) = stream else {
            return;
        };

        let mut should_flush = test.failed() || test_log_collect;

        if let Some(scan) = self.scan.as_ref().filter(|x| x.is_enabled()) {
            if scan_nodes(&*stream, scan, &node_containers, self.node_count, test) {
                should_flush = true;
            }

            info!("finished scanning node logs for concerning errors");
        }

        if should_flush {
            info!("flushing log stream");

            if let Err(err) = stream.flush_and_shutdown() {
                error!(%err, "error flushing and shutting down log stream");
            }

            for (target, location) in stream.log_target_locations() {
                info!(%target, %location, "log target location");
            }

            if let Err(err) = stream.save_log_location_in_test_summary() {
                error!(%err, "error saving log location in test summary");
            }
        }

        info!("finished shutting down log stream");
    }
}

/// Scans each node's logs in order. Returns true and fails the test on the
/// first node with concerning lines.
///
/// Nodes are processed one at a time: the stream stops taking new lines while
/// a container is being read.
fn scan_nodes<L: LogStream + ?Sized>(
    stream: &L,
    scan: &LogScanSettings,
    node_containers: &[String],
    node_count: usize,
    test: &dyn TestHandle,
) -> bool {
    let processor = LogProcessor::<L, usize>::new(stream);

    for i in 0..node_count {
        // the cluster may have been partially built
        let Some(container) = node_containers.get(i) else {
            continue;
        };

        let result = processor.process_container_logs(container, |line, count| {
            *count = scan_log_line(
                &line.content,
                scan.failing_level,
                *count,
                scan.threshold,
                &scan.allowed_messages,
            )?;

            Ok(())
        });

        match result {
            Ok(_) => (),
            Err(err) if err.is_concerning() => {
                test.fail(format!("found a concerning log in node logs: {err}"));
                return true;
            }
            Err(err) => {
                error!(%err, %container, "error processing node logs");
            }
        }
    }

    false
}
