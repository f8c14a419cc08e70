use chrono::Local;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Off,
}

impl Severity {
    fn label(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Notice => "NOTICE",
            Severity::Warning => "WARN",
            Severity::Error => "ERROR",
            Severity::Off => "OFF",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "notice" => Ok(Severity::Notice),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "off" => Ok(Severity::Off),
            other => Err(format!("Invalid severity: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Configuration,
    Consumer,
    Database,
    GarbageCollector,
    Health,
    Http,
}

impl Component {
    fn label(&self) -> &'static str {
        match self {
            Component::Configuration => "configuration",
            Component::Consumer => "consumer",
            Component::Database => "database",
            Component::GarbageCollector => "gc",
            Component::Health => "health",
            Component::Http => "http",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogLevels {
    pub default: Severity,
    pub consumer: Option<Severity>,
    pub database: Option<Severity>,
    pub http: Option<Severity>,
    pub gc: Option<Severity>,
    pub health: Option<Severity>,
}

impl Default for LogLevels {
    fn default() -> Self {
        LogLevels { default: Severity::Info, consumer: None, database: None, http: None, gc: None, health: None }
    }
}

impl LogLevels {
    fn min_severity(&self, component: Component) -> Severity {
        let specific = match component {
            Component::Consumer => self.consumer,
            Component::Database => self.database,
            Component::Http => self.http,
            Component::GarbageCollector => self.gc,
            Component::Health => self.health,
            Component::Configuration => None,
        };
        specific.unwrap_or(self.default)
    }
}

static LEVELS: OnceLock<LogLevels> = OnceLock::new();

/// First call wins, later calls are ignored. Tests leave it unset and get Info.
pub fn init(levels: LogLevels) {
    let _ = LEVELS.set(levels);
}

pub fn log(component: Component, severity: Severity, args: fmt::Arguments) {
    if severity == Severity::Off {
        return;
    }
    let levels = LEVELS.get_or_init(LogLevels::default);
    if severity < levels.min_severity(component) {
        return;
    }
    let now = Local::now();
    println!("[{}] {} [{}] {}", now.format("%Y-%m-%d %H:%M:%S"), severity.label(), component.label(), args);
}

#[macro_export]
macro_rules! debug {
    ($c:expr, $($arg:tt)*) => {
        $crate::logger::log($c, $crate::logger::Severity::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($c:expr, $($arg:tt)*) => {
        $crate::logger::log($c, $crate::logger::Severity::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! notice {
    ($c:expr, $($arg:tt)*) => {
        $crate::logger::log($c, $crate::logger::Severity::Notice, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($c:expr, $($arg:tt)*) => {
        $crate::logger::log($c, $crate::logger::Severity::Warning, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($c:expr, $($arg:tt)*) => {
        $crate::logger::log($c, $crate::logger::Severity::Error, format_args!($($arg)*))
    };
}
