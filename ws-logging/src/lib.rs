//! Process-wide tracing setup for provisioner binaries.
//!
//! Configuration comes from the environment:
//!
//! * `WS_LOG_LEVEL` - filter directive used when `RUST_LOG` is unset (default `info`)
//! * `WS_LOG_OUTPUT` - `console`, `file`, `both` or `none` (default `console`)
//! * `WS_LOG_FORMAT` - `human` or `json` (default `human`)
//! * `WS_LOG_TAGS` - comma separated `key:value` span field filters, `*` matches any value
//! * `WS_LOG_FILE_PATH` - daily rolled log file (default `/tmp/ws-provisioner.log`)

use std::{
    collections::HashMap,
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::MakeWriter,
    layer::{Context, Layer},
    prelude::*,
    registry, EnvFilter,
};

const DEFAULT_LOG_FILE: &str = "/tmp/ws-provisioner.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Logging settings resolved from `WS_LOG_*` variables.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub output: LogOutput,
    pub format: LogFormat,
    pub tags: Vec<Tag>,
    pub file_path: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Console,
            format: LogFormat::Human,
            tags: Vec::new(),
            file_path: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let output = match lookup("WS_LOG_OUTPUT").as_deref() {
            Some("file") => LogOutput::File,
            Some("both") => LogOutput::Both,
            Some("none") => LogOutput::None,
            _ => LogOutput::Console,
        };
        let format = match lookup("WS_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };

        Self {
            level: lookup("WS_LOG_LEVEL").unwrap_or(defaults.level),
            output,
            format,
            tags: lookup("WS_LOG_TAGS")
                .map(|raw| parse_tags(&raw))
                .unwrap_or_default(),
            file_path: lookup("WS_LOG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.file_path),
        }
    }
}

/// Parse `key:value,key2:value2`; malformed entries are skipped.
pub fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|s| {
            let (key, value) = s.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some(Tag {
                key: key.to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

// Writes every record to both the console and the log file.
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write(buf);
        let res_b = self.b.write(buf);
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = Tee<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

/// Drops events whose enclosing spans do not carry every configured tag,
/// e.g. `job_id:*` keeps only output produced while handling a job.
struct TagFilterLayer {
    filters: Vec<Tag>,
}

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = HashMap::new();
        attrs.record(&mut FieldVisitor(&mut fields));
        span.extensions_mut().insert(fields);
    }

    fn enabled(&self, _meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        let Some(scope) = ctx.current_span().id().and_then(|id| ctx.span_scope(id)) else {
            return false;
        };

        let mut all_fields = HashMap::new();
        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<HashMap<String, String>>() {
                for (k, v) in fields {
                    all_fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        tags_match(&self.filters, &all_fields)
    }
}

fn tags_match(filters: &[Tag], fields: &HashMap<String, String>) -> bool {
    filters.iter().all(|filter| {
        fields
            .get(&filter.key)
            .is_some_and(|value| filter.value == "*" || value.contains(&filter.value))
    })
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{value:?}"));
    }
}

fn build_filter(level: &str) -> EnvFilter {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    ["sqlx=warn", "tokio=warn"]
        .iter()
        .filter_map(|d| d.parse().ok())
        .fold(filter, |f, directive| f.add_directive(directive))
}

/// Initializes the global tracing subscriber from `WS_LOG_*` variables.
///
/// The returned guard must be held for the life of the process when file
/// output is enabled, otherwise buffered records are lost on exit.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(LogConfig::from_env())
}

pub fn init_with(config: LogConfig) -> Option<WorkerGuard> {
    let subscriber = registry()
        .with(build_filter(&config.level))
        .with(TagFilterLayer {
            filters: config.tags.clone(),
        });

    let log_dir = config
        .file_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("/tmp"));
    let log_filename = config
        .file_path
        .file_name()
        .unwrap_or("ws-provisioner.log".as_ref());
    let is_json = config.format == LogFormat::Json;

    macro_rules! init_fmt {
        ($writer:expr) => {{
            let fmt_layer = tracing_subscriber::fmt::layer().with_writer($writer);
            let result = if is_json {
                subscriber.with(fmt_layer.json()).try_init()
            } else {
                subscriber.with(fmt_layer.pretty()).try_init()
            };
            if let Err(e) = result {
                eprintln!("tracing subscriber already installed: {e}");
            }
        }};
    }

    match config.output {
        LogOutput::Both => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            init_fmt!(MakeTee {
                make_a: std::io::stdout,
                make_b: non_blocking,
            });
            Some(guard)
        }
        LogOutput::Console => {
            init_fmt!(std::io::stdout);
            None
        }
        LogOutput::File => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            init_fmt!(non_blocking);
            Some(guard)
        }
        LogOutput::None => {
            let _ = subscriber.try_init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_when_unset() {
        let config = LogConfig::from_lookup(|_| None);
        assert_eq!(config.level, "info");
        assert_eq!(config.output, LogOutput::Console);
        assert_eq!(config.format, LogFormat::Human);
        assert!(config.tags.is_empty());
        assert_eq!(config.file_path, PathBuf::from(DEFAULT_LOG_FILE));
    }

    #[test]
    fn test_config_reads_overrides() {
        let vars: HashMap<&str, &str> = [
            ("WS_LOG_LEVEL", "debug"),
            ("WS_LOG_OUTPUT", "both"),
            ("WS_LOG_FORMAT", "json"),
            ("WS_LOG_TAGS", "job_id:*"),
            ("WS_LOG_FILE_PATH", "/var/log/ws/runner.log"),
        ]
        .into_iter()
        .collect();

        let config = LogConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.level, "debug");
        assert_eq!(config.output, LogOutput::Both);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.tags.len(), 1);
        assert_eq!(config.file_path, PathBuf::from("/var/log/ws/runner.log"));
    }

    #[test]
    fn test_parse_tags_skips_malformed_entries() {
        let tags = parse_tags("job_id:*, workspace_id:abc ,broken,:nokey");
        assert_eq!(
            tags,
            vec![
                Tag {
                    key: "job_id".into(),
                    value: "*".into()
                },
                Tag {
                    key: "workspace_id".into(),
                    value: "abc".into()
                },
            ]
        );
    }

    #[test]
    fn test_tags_match_wildcard_and_substring() {
        let mut fields = HashMap::new();
        fields.insert("job_id".to_string(), "job-123".to_string());

        assert!(tags_match(&parse_tags("job_id:*"), &fields));
        assert!(tags_match(&parse_tags("job_id:123"), &fields));
        assert!(!tags_match(&parse_tags("job_id:999"), &fields));
        assert!(!tags_match(&parse_tags("workspace_id:*"), &fields));
    }
}
