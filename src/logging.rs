use chrono::Local;
use log::LevelFilter;
use std::io::Write;

/// Installs `env_logger` at `level`. `RUST_LOG`, when set, overrides it.
///
/// Returns false when a logger was already installed (tests, embedding hosts).
pub fn init(level: LevelFilter) -> bool {
    let result = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();

    match result {
        Ok(()) => {
            log::info!("Logging initialized at {}", level);
            true
        }
        Err(_) => false,
    }
}
