/*
 * Copyright (C) 2026 The Sharedpath Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::borrow::Cow;
use std::io::Write;
use std::sync::OnceLock;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

static FORMAT: OnceLock<LogFormat> = OnceLock::new();

/// Pins the output format for the rest of the process. The first caller
/// wins; without a caller the `SHAREDPATH_LOG_FORMAT` environment variable
/// decides, defaulting to text.
pub fn set_log_format(format: LogFormat) {
    let _ = FORMAT.set(format);
}

fn current_format() -> LogFormat {
    *FORMAT.get_or_init(|| {
        match std::env::var("SHAREDPATH_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    })
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn name(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Everything one log line carries besides the timestamp.
struct Record<'a> {
    level: Level,
    component: &'a str,
    message: &'a str,
    metadata: &'a [(&'a str, &'a str)],
}

/// Bare tokens pass through; anything else is rendered with Rust's string
/// escaping, which quotes and escapes in one step.
fn field_value(value: &str) -> Cow<'_, str> {
    let bare = !value.is_empty()
        && value
            .chars()
            .all(|c| !c.is_whitespace() && !matches!(c, '"' | '\\' | '='));
    if bare {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("{value:?}"))
    }
}

/// Text lines lead with a human-oriented prefix and carry the metadata as a
/// key=value tail:
///
/// `2026-08-02T09:15:04.312Z WARN  node: heartbeat failed node_id=n1`
fn render(format: LogFormat, timestamp: &str, record: &Record<'_>) -> String {
    match format {
        LogFormat::Text => {
            let mut line = format!(
                "{timestamp} {:<5} {}: {}",
                record.level.name(),
                record.component,
                record.message
            );
            for (key, value) in record.metadata {
                if key.is_empty() {
                    continue;
                }
                line.push(' ');
                line.push_str(key);
                line.push('=');
                line.push_str(&field_value(value));
            }
            line
        }
        LogFormat::Json => {
            let mut payload = Map::new();
            payload.insert("ts".into(), Value::String(timestamp.to_string()));
            payload.insert(
                "level".into(),
                Value::String(record.level.name().to_string()),
            );
            payload.insert(
                "component".into(),
                Value::String(record.component.to_string()),
            );
            payload.insert("msg".into(), Value::String(record.message.to_string()));
            for (key, value) in record.metadata {
                if key.is_empty() {
                    continue;
                }
                payload.insert((*key).to_string(), Value::String((*value).to_string()));
            }
            Value::Object(payload).to_string()
        }
    }
}

fn emit(level: Level, component: &str, message: &str, metadata: &[(&str, &str)]) {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let record = Record {
        level,
        component,
        message,
        metadata,
    };
    let line = render(current_format(), &timestamp, &record);
    if matches!(level, Level::Warn | Level::Error) {
        let _ = writeln!(std::io::stderr().lock(), "{line}");
    } else {
        let _ = writeln!(std::io::stdout().lock(), "{line}");
    }
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    emit(Level::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    emit(Level::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    emit(Level::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    emit(Level::Error, component, message, metadata);
}
