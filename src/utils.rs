use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{Level, LevelFilter, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use chatsync::models::{Chat, Direction};
use chatsync::wire::format_timestamp;

// Helpers for the demo binary: logging setup and chat rendering

/// Logger writing one line per record to a file, or to stdout when no file is given
pub struct LineLogger {
    sink: Option<Mutex<File>>,
}

impl LineLogger {
    pub fn new(log_file_path: Option<&str>) -> Result<Self> {
        let sink = match log_file_path {
            Some(path) => Some(Mutex::new(OpenOptions::new().create(true).append(true).open(path)?)),
            None => None,
        };
        Ok(LineLogger { sink })
    }
}

/// `<utc time> <LEVEL> <module> > <message>`
fn format_line(now: DateTime<Utc>, level: Level, target: &str, message: &str) -> String {
    format!(
        "{} {:<5} {} > {}\n",
        now.to_rfc3339_opts(SecondsFormat::Millis, true),
        level,
        target,
        message
    )
}

impl log::Log for LineLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(Utc::now(), record.level(), record.target(), &record.args().to_string());
        match &self.sink {
            Some(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.write_all(line.as_bytes());
                }
            }
            None => print!("{}", line),
        }
    }

    fn flush(&self) {
        match &self.sink {
            Some(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.flush();
                }
            }
            None => {
                let _ = std::io::stdout().flush();
            }
        }
    }
}

pub fn init_logging(log_file: Option<&str>, level: LevelFilter) -> Result<()> {
    log::set_boxed_logger(Box::new(LineLogger::new(log_file)?))?;
    log::set_max_level(level);
    log::info!("{} {} logging at {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"), level);
    Ok(())
}

/// Render a chat and its messages for the terminal
pub fn format_chat(chat: &Chat) -> String {
    let mut out = format!(
        "{} ({}) - {} unread - last: {:?}",
        chat.name, chat.phone_number, chat.unread_count, chat.last_message
    );
    for message in &chat.messages {
        let who = match message.direction {
            Direction::Outgoing => "admin",
            Direction::Incoming => "user",
        };
        out.push_str(&format!(
            "\n  [{}] {:>5}: {} ({})",
            format_timestamp(&message.timestamp),
            who,
            message.summary(),
            message.status.as_str()
        ));
    }
    out
}
