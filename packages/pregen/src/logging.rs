//! Global logging system.

use std::{
    fs::File,
    sync::Arc,
    env,
    panic,
};
use backtrace::Backtrace;
use tracing_subscriber::{
    fmt::{
        self,
        time::uptime,
    },
    prelude::*,
    Registry,
    EnvFilter,
};


/// Default logging environment filter: this crate is debug, everything else
/// is warn. `RUST_LOG` entries are appended on top.
const DEFAULT_FILTER: &'static str = "warn,pregen=debug";

const LOG_FILE_NAME: &'static str = "pregen.log";

/// Install a `tracing` backend logging to stdout and to a log file, and make
/// panics go through it too.
pub fn init_logging() {
    let stdout_log = fmt::layer()
        .event_format(fmt::format()
            .compact()
            .with_timer(uptime())
            .with_line_number(true));
    let log_file = File::create(LOG_FILE_NAME)
        .expect("unable to create log file");
    let file_log = fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(log_file));

    let mut filter = DEFAULT_FILTER.to_owned();
    if let Ok(env_filter) = env::var(EnvFilter::DEFAULT_ENV) {
        filter.push(',');
        filter.push_str(&env_filter);
    }

    Registry::default()
        .with(EnvFilter::new(filter))
        .with(stdout_log)
        .with(file_log)
        .init();

    panic::set_hook(Box::new(|info| {
        error!("{}", info);
        if env::var("RUST_BACKTRACE").map(|val| val == "1").unwrap_or(true) {
            error!("{:?}", Backtrace::new());
        }
    }));
    trace!("logging initialized");
}
