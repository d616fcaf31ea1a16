//! Structured command results.
//!
//! Every invocation ends with exactly one JSON object on stdout:
//! `{"command": …, "ok": …, "exit_code": …, …}`. Logs go to stderr, so the
//! stdout stream stays machine-readable for scripts and cron wrappers.

#![forbid(unsafe_code)]

use serde::Serialize;
use serde_json::{Map, Value};

/// The terminal outcome of one command.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    command: String,
    exit_code: i32,
    fields: Map<String, Value>,
}

impl Report {
    /// A successful report for `command`.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            exit_code: 0,
            fields: Map::new(),
        }
    }

    /// A failed report carrying a stable error code and message.
    #[must_use]
    pub fn failure(
        command: impl Into<String>,
        exit_code: i32,
        error_code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(command)
            .with_exit_code(exit_code)
            .with("error_code", error_code)
            .with("error", message.into())
    }

    /// Attach a field. Values that fail to serialize are recorded as `null`.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.fields.insert(key.to_string(), value);
        self
    }

    /// Attach every top-level field of a serializable struct. Non-object
    /// values are stored under `result`.
    #[must_use]
    pub fn with_fields(mut self, value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(Value::Object(map)) => self.fields.extend(map),
            Ok(other) => {
                self.fields.insert("result".into(), other);
            }
            Err(e) => {
                tracing::warn!(command = %self.command, error = %e, "result not serializable");
            }
        }
        self
    }

    #[must_use]
    pub const fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.exit_code
    }

    #[must_use]
    pub const fn ok(&self) -> bool {
        self.exit_code == 0
    }

    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut out = Map::with_capacity(self.fields.len() + 3);
        out.insert("command".into(), Value::from(self.command.as_str()));
        out.insert("ok".into(), Value::from(self.ok()));
        out.insert("exit_code".into(), Value::from(self.exit_code));
        for (k, v) in &self.fields {
            out.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Value::Object(out)
    }

    /// Single-line JSON rendering (no trailing newline).
    #[must_use]
    pub fn to_line(&self) -> String {
        self.to_value().to_string()
    }

    /// Print the report line to stdout.
    pub fn emit(&self) {
        println!("{}", self.to_line());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_come_first() {
        let line = Report::new("checkpoint").with("mode", "TRUNCATE").to_line();
        assert_eq!(
            line,
            r#"{"command":"checkpoint","ok":true,"exit_code":0,"mode":"TRUNCATE"}"#
        );
    }

    #[test]
    fn failure_sets_exit_code_and_error_fields() {
        let report = Report::failure("backup", 5, "LOCK_CONFLICT", "busy");
        assert!(!report.ok());
        assert_eq!(report.exit_code(), 5);
        let v = report.to_value();
        assert_eq!(v["ok"], false);
        assert_eq!(v["exit_code"], 5);
        assert_eq!(v["error_code"], "LOCK_CONFLICT");
        assert_eq!(v["error"], "busy");
    }

    #[test]
    fn fields_cannot_shadow_the_header() {
        let v = Report::new("verify").with("ok", false).to_value();
        assert_eq!(v["ok"], true);
    }

    #[test]
    fn with_fields_flattens_structs() {
        #[derive(Serialize)]
        struct Outcome {
            size_bytes: u64,
            backend: &'static str,
        }
        let v = Report::new("backup")
            .with_fields(Outcome {
                size_bytes: 4096,
                backend: "snapshot",
            })
            .with_fields(7)
            .to_value();
        assert_eq!(v["size_bytes"], 4096);
        assert_eq!(v["backend"], "snapshot");
        assert_eq!(v["result"], 7);
    }

    #[test]
    fn output_is_one_line() {
        let line = Report::new("health")
            .with("details", vec!["a\nb", "c"])
            .to_line();
        assert!(!line.contains('\n'));
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["details"][0], "a\nb");
    }
}
