//! Logging setup: a rolling file appender scoped to the engine's data root,
//! so separate `EngineConfig::root` directories never share one log.

use std::path::Path;

const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
const MAX_ROLLED_FILES: u32 = 7;

/// Initialize logging into `{root}/logs/chronodb.log`, rolling to
/// `chronodb.{1..7}.log` once the active file passes 10 MiB. Creates the
/// log directory if missing.
///
/// # Errors
/// Returns an error if the log directory or file cannot be created.
pub fn init_for_root(root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    use log::LevelFilter;
    use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
    use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
    use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
    use log4rs::append::rolling_file::RollingFileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let log_dir = root.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let logfile_path = log_dir.join("chronodb.log");
    let roller_pattern = log_dir.join("chronodb.{}.log");

    let roller = FixedWindowRoller::builder().build(&roller_pattern.display().to_string(), MAX_ROLLED_FILES)?;
    let trigger = SizeTrigger::new(MAX_LOG_BYTES);
    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller));
    let encoder = Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}"));
    let appender = RollingFileAppender::builder().encoder(encoder).build(logfile_path, Box::new(policy))?;

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(appender)))
        .build(Root::builder().appender("file").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;
    Ok(())
}
