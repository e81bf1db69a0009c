use anyhow::Result;
use log::{Level, LevelFilter, Metadata, Record};

struct CliLogger;

impl log::Log for CliLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            match record.level() {
                Level::Error => {
                    eprint!("{} ", ::console::style("error:").red().bold());
                }
                Level::Warn => {
                    eprint!("{} ", ::console::style("warn:").yellow().bold());
                }
                Level::Info => {
                    eprint!("{} ", ::console::style("info:").cyan().bold());
                }
                Level::Debug | Level::Trace => {
                    eprint!("{} ", ::console::style("debug:").dim());
                }
            }
            eprintln!("{}", record.args());
        }
    }

    fn flush(&self) {}
}

pub fn init() -> Result<()> {
    let level = if std::env::var_os("NET_SERVERS_DEBUG").is_some() {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    log::set_boxed_logger(Box::new(CliLogger)).map(|()| log::set_max_level(level))?;
    Ok(())
}

#[inline]
pub fn style_bool(pred: bool) -> &'static str {
    if pred {
        "\x1b[1m\x1b[32mYes\x1b[0m"
    } else {
        "\x1b[34mNo\x1b[0m"
    }
}
