/*
 * This file is part of Chassis Manager.
 *
 * Copyright (C) 2025 Chassis Manager contributors
 *
 * Chassis Manager is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Chassis Manager is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Chassis Manager. If not, see <https://www.gnu.org/licenses/>.
 */

//! Notification journal
//!
//! Appends one JSON object per line for every change notification and daemon
//! event. The journal file is process-wide; until it is opened, lines go to a
//! fallback file under /tmp.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use cm_core::NotificationSink;
use cm_protocol::Notification;
use lazy_static::lazy_static;
use serde_json::{json, Value};

const FALLBACK_PATH: &str = "/tmp/chassisd_notifications.json";

lazy_static! {
    static ref JOURNAL: Mutex<Option<File>> = Mutex::new(None);
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Open the journal at `path`, falling back to /tmp. Returns the path in use.
pub fn init_journal(path: &Path) -> PathBuf {
    let (file, used) = match open_append(path) {
        Ok(f) => (Some(f), path.to_path_buf()),
        Err(_) => (open_append(Path::new(FALLBACK_PATH)).ok(), PathBuf::from(FALLBACK_PATH)),
    };
    if let Ok(mut guard) = JOURNAL.lock() {
        *guard = file;
    }
    used
}

/// Stop writing to the current journal file
pub fn close_journal() {
    if let Ok(mut guard) = JOURNAL.lock() {
        *guard = None;
    }
}

pub fn log_event(event: &str, data: Value) {
    let line = json!({
        "ts_ms": now_millis(),
        "event": event,
        "data": data,
    })
    .to_string();

    if let Ok(mut guard) = JOURNAL.lock() {
        if let Some(f) = guard.as_mut() {
            let _ = writeln!(f, "{}", line);
            return;
        }
    }
    if let Ok(mut f) = open_append(Path::new(FALLBACK_PATH)) {
        let _ = writeln!(f, "{}", line);
    }
}

/// Read back every line of a journal file
pub fn read_journal(path: &Path) -> anyhow::Result<Vec<Value>> {
    let file = File::open(path).with_context(|| format!("opening journal {:?}", path))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Value = serde_json::from_str(&line)
            .with_context(|| format!("parsing journal line {:?}", line))?;
        out.push(event);
    }
    Ok(out)
}

/// Notification sink that journals every notification
#[derive(Debug, Default)]
pub struct JournalSink;

impl NotificationSink for JournalSink {
    fn notify(&self, notification: &Notification) {
        log_event(
            "notification",
            json!({
                "class": notification.class,
                "key": notification.key,
                "fields": notification.fields,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_protocol::ResourceClass;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_notifications_written_as_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("journal.json");
        assert_eq!(init_journal(&path), path);

        let sink = JournalSink;
        let note = Notification::new(ResourceClass::Fan, "fan/psu/1/#1").with("observed_speed", 80);
        sink.notify(&note);
        log_event("startup", json!({ "entities": 7 }));
        close_journal();

        let lines = read_journal(&path).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "notification");
        assert_eq!(lines[0]["data"]["class"], "fan");
        assert_eq!(lines[0]["data"]["key"], "fan/psu/1/#1");
        assert_eq!(lines[0]["data"]["fields"]["observed_speed"], 80);
        assert_eq!(lines[1]["data"]["entities"], 7);
    }

    #[test]
    #[serial]
    fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.json");
        init_journal(&path);
        log_event("first", Value::Null);
        init_journal(&path);
        log_event("second", Value::Null);
        close_journal();

        let events: Vec<_> = read_journal(&path)
            .unwrap()
            .into_iter()
            .map(|v| v["event"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(events, vec!["first", "second"]);
    }
}
