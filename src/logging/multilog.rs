use log::{LevelFilter, Log, Metadata, Record};

/// Caps the verbosity of every record whose target starts with `prefix`.
struct TargetFilter {
    prefix: String,
    max_level: LevelFilter,
}

impl TargetFilter {
    fn drops(&self, metadata: &Metadata) -> bool {
        metadata.target().starts_with(&self.prefix) && metadata.level() > self.max_level
    }
}

/// Fans every record out to all registered loggers that accept it.
pub struct MultiLogger {
    loggers: Vec<Box<dyn Log>>,
    max_level: LevelFilter,
    filters: Vec<TargetFilter>,
}

impl Default for MultiLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiLogger {
    pub fn new() -> Self {
        Self {
            loggers: Vec::new(),
            max_level: LevelFilter::Trace,
            filters: Vec::new(),
        }
    }

    pub fn with_logger(mut self, logger: Box<dyn Log>) -> Self {
        self.loggers.push(logger);
        self
    }

    pub fn with_max_level(mut self, max_level: LevelFilter) -> Self {
        self.max_level = max_level;
        self
    }

    /// Drops records of targets starting with `target` that are more verbose than `max_level`,
    /// for every logger.
    pub fn with_global_filter(mut self, target: impl Into<String>, max_level: LevelFilter) -> Self {
        self.filters.push(TargetFilter {
            prefix: target.into(),
            max_level,
        });
        self
    }

    pub fn add_logger(&mut self, logger: Box<dyn Log>) {
        self.loggers.push(logger);
    }

    /// Installs the logger as the process-wide `log` backend.
    pub fn init(self) -> Result<(), log::SetLoggerError> {
        log::set_max_level(self.max_level);
        log::set_boxed_logger(Box::new(self))
    }

    fn filtered(&self, metadata: &Metadata) -> bool {
        self.filters.iter().any(|f| f.drops(metadata))
    }
}

impl Log for MultiLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        !self.filtered(metadata) && self.loggers.iter().any(|l| l.enabled(metadata))
    }

    fn log(&self, record: &Record) {
        if self.filtered(record.metadata()) {
            return;
        }
        for logger in self.loggers.iter().filter(|l| l.enabled(record.metadata())) {
            logger.log(record);
        }
    }

    fn flush(&self) {
        self.loggers.iter().for_each(|l| l.flush());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use log::Level;

    use super::*;

    /// Collects the messages it receives.
    #[derive(Clone, Default)]
    struct Capture {
        max_level: Option<Level>,
        messages: Arc<Mutex<Vec<String>>>,
    }

    impl Capture {
        fn accepting(max_level: Level) -> Self {
            Self {
                max_level: Some(max_level),
                ..Default::default()
            }
        }

        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl Log for Capture {
        fn enabled(&self, metadata: &Metadata) -> bool {
            self.max_level.is_some_and(|max| metadata.level() <= max)
        }

        fn log(&self, record: &Record) {
            self.messages.lock().unwrap().push(record.args().to_string());
        }

        fn flush(&self) {}
    }

    fn record<'a>(level: Level, target: &'a str, args: std::fmt::Arguments<'a>) -> Record<'a> {
        Record::builder().level(level).target(target).args(args).build()
    }

    #[test]
    fn test_fan_out() {
        let verbose = Capture::accepting(Level::Debug);
        let quiet = Capture::accepting(Level::Warn);
        let multi = MultiLogger::new()
            .with_logger(Box::new(verbose.clone()))
            .with_logger(Box::new(quiet.clone()));

        multi.log(&record(Level::Info, "commissioner", format_args!("info")));
        multi.log(&record(Level::Error, "commissioner", format_args!("error")));

        assert_eq!(verbose.messages(), vec!["info", "error"]);
        assert_eq!(quiet.messages(), vec!["error"]);
    }

    #[test]
    fn test_enabled_when_any_logger_is() {
        let multi = MultiLogger::new()
            .with_logger(Box::new(Capture::default()))
            .with_logger(Box::new(Capture::accepting(Level::Error)));
        let error = Metadata::builder().level(Level::Error).build();
        let info = Metadata::builder().level(Level::Info).build();
        assert!(multi.enabled(&error));
        assert!(!multi.enabled(&info));

        let none = MultiLogger::new().with_logger(Box::new(Capture::default()));
        assert!(!none.enabled(&error));
    }

    #[test]
    fn test_global_filter() {
        let capture = Capture::accepting(Level::Trace);
        let multi = MultiLogger::new()
            .with_logger(Box::new(capture.clone()))
            .with_global_filter("rayon", LevelFilter::Warn);

        multi.log(&record(Level::Debug, "rayon_core::registry", format_args!("dropped")));
        multi.log(&record(Level::Warn, "rayon_core::registry", format_args!("kept")));
        multi.log(&record(Level::Debug, "commissioner::workers", format_args!("unfiltered")));

        assert_eq!(capture.messages(), vec!["kept", "unfiltered"]);
        assert!(!multi.enabled(
            &Metadata::builder()
                .level(Level::Info)
                .target("rayon")
                .build()
        ));
    }
}
