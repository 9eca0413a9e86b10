use std::io::Write;

use chrono::Local;
use log::LevelFilter;

/// Installs the global logger.
///
/// Every record is written to stderr with a local RFC 3339 timestamp;
/// `RUST_LOG` takes precedence over `level`. Calling it again is a no-op.
pub fn init(level: LevelFilter) {
    let result = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.args()
            )
        })
        .try_init();

    if result.is_ok() {
        log::debug!("Logging initialized");
    }
}
