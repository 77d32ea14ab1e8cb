// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Tracing bootstrap.
//!
//! Emits one flat JSON object per event: timestamp, level, target, the
//! dotted span path, and the event fields at top level. The sink (stderr,
//! stdout, or a rotating file) and the fallback level come from a small
//! YAML section; a `RUST_LOG` in the environment always wins over the
//! configured level.

use std::{fs, io, path::PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use fastrace::collector::{Config as TraceConfig, ConsoleReporter};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{Event, Subscriber};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{
        self, FmtContext, FormatEvent, FormatFields,
        format::Writer,
        writer::BoxMakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
};

#[derive(Debug, Deserialize)]
struct LoggerFile {
    logger: LoggerSettings,
}

#[derive(Debug, Deserialize)]
pub struct LoggerSettings {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `"info"` or
    /// `"weft=debug,info"`.
    #[serde(default = "default_level")]
    level: String,
    #[serde(default)]
    sink: Sink,
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Sink {
    #[default]
    Stderr,
    Stdout,
    File {
        path: PathBuf,
        #[serde(default)]
        rotate: Rotate,
    },
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum Rotate {
    #[default]
    Never,
    Daily,
    Hourly,
    Minutely,
}

/// One event, one line, no nesting: `{"ts":…,"level":…,"target":…,
/// "span":"a.b","message":…,<fields>…}`.
struct FlatLine;

impl<S, N> FormatEvent<S, N> for FlatLine
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        let mut line = serde_json::Map::with_capacity(8);
        line.insert(
            "ts".to_string(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        line.insert("level".to_string(), json!(meta.level().as_str()));
        line.insert("target".to_string(), json!(meta.target()));

        if let Some(scope) = ctx.event_scope() {
            let path = scope
                .from_root()
                .map(|span| span.name())
                .collect::<Vec<_>>()
                .join(".");
            if !path.is_empty() {
                line.insert("span".to_string(), json!(path));
            }
        }

        event.record(&mut FieldMap(&mut line));

        writeln!(
            writer,
            "{}",
            serde_json::to_string(&Value::Object(line)).map_err(|_| std::fmt::Error)?
        )
    }
}

/// Collects event fields straight into the output map, keeping their
/// native JSON types where tracing exposes them.
struct FieldMap<'a>(&'a mut serde_json::Map<String, Value>);

impl tracing::field::Visit for FieldMap<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), json!(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), json!(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0.insert(field.name().to_string(), json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.insert(field.name().to_string(), json!(value));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.0.insert(field.name().to_string(), json!(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0.insert(field.name().to_string(), json!(value));
    }
}

/// Installs the global subscriber from a logger YAML. Keep the returned
/// guard alive for the process lifetime, or buffered lines are lost.
pub fn init_logger(config_path: &str) -> Result<WorkerGuard> {
    let raw = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read logger config {config_path}"))?;
    let settings = serde_yaml::from_str::<LoggerFile>(&raw)
        .with_context(|| format!("failed to parse logger config {config_path}"))?
        .logger;

    let (writer, guard) = open_sink(&settings.sink)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .with_context(|| format!("bad level directive {:?}", settings.level))?;

    fastrace::set_reporter(ConsoleReporter, TraceConfig::default());

    let subscriber = Registry::default()
        .with(filter)
        .with(fastrace_tracing::FastraceCompatLayer::new())
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .event_format(FlatLine),
        );
    tracing::subscriber::set_global_default(subscriber)
        .context("a global subscriber is already installed")?;

    Ok(guard)
}

fn open_sink(sink: &Sink) -> Result<(BoxMakeWriter, WorkerGuard)> {
    let (writer, guard) = match sink {
        Sink::Stderr => tracing_appender::non_blocking(io::stderr()),
        Sink::Stdout => tracing_appender::non_blocking(io::stdout()),
        Sink::File { path, rotate } => {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "weft.log".into());
            let appender = match rotate {
                Rotate::Never => rolling::never(dir, name),
                Rotate::Daily => rolling::daily(dir, name),
                Rotate::Hourly => rolling::hourly(dir, name),
                Rotate::Minutely => rolling::minutely(dir, name),
            };
            tracing_appender::non_blocking(appender)
        },
    };
    Ok((BoxMakeWriter::new(writer), guard))
}
