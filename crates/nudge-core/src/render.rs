use std::io::{self, IsTerminal, Write};

use anyhow::anyhow;
use chrono::NaiveDate;
use unicode_width::UnicodeWidthStr;

use crate::config::{Config, KEY_COLOR};
use crate::datetime::format_day_key;
use crate::index::DayBucket;
use crate::reminders::Reminder;
use crate::settings::Settings;
use crate::todo::Todo;

const ID_PREVIEW: usize = 8;

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color = match cfg.get(KEY_COLOR) {
            None => true,
            Some(raw) => cfg
                .get_bool(KEY_COLOR)
                .ok_or_else(|| anyhow!("invalid color setting: {raw}"))?,
        };
        Ok(Self { color })
    }

    #[tracing::instrument(skip(self, bucket))]
    pub fn print_day(&self, day: NaiveDate, bucket: &DayBucket) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        self.write_day(&mut out, day, bucket)
    }

    pub fn write_day<W: Write>(
        &self,
        mut out: W,
        day: NaiveDate,
        bucket: &DayBucket,
    ) -> anyhow::Result<()> {
        writeln!(out, "{}", self.paint(&format_day_key(day), "1"))?;
        if bucket.is_empty() {
            writeln!(out, "  nothing planned")?;
            return Ok(());
        }

        let mut table = Table::new(["#", "ID", "Target"]);
        for todo in &bucket.incomplete {
            table.push([
                todo.priority.to_string(),
                self.paint(short_id(&todo.id), "33"),
                todo.title.clone(),
            ]);
        }
        for todo in &bucket.completed {
            table.push([
                self.paint("✓", "32"),
                self.paint(short_id(&todo.id), "33"),
                self.paint(&todo.title, "2"),
            ]);
        }
        table.write_to(&mut out)
    }

    pub fn print_todo(&self, verb: &str, todo: &Todo) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(
            out,
            "{verb} {} {} ({} #{})",
            self.paint(short_id(&todo.id), "33"),
            todo.title,
            todo.due_date.format("%Y-%m-%d"),
            todo.priority
        )?;
        Ok(())
    }

    pub fn print_reminder(&self, reminder: &Reminder, schedule: &str) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(
            out,
            "{} {} [{}] {}",
            self.paint(&reminder.title, "1"),
            reminder.body,
            short_id(&reminder.todo_id),
            schedule
        )?;
        Ok(())
    }

    pub fn print_settings(&self, settings: &Settings) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        let apps = if settings.monitored_apps.is_empty() {
            "-".to_string()
        } else {
            settings.monitored_apps.join(", ")
        };
        let mut table = Table::new(["Setting", "Value"]);
        table.push(["theme".to_string(), settings.theme.to_string()]);
        table.push(["mode".to_string(), settings.mode.to_string()]);
        table.push(["monitored apps".to_string(), apps]);
        table.push([
            "reminder interval".to_string(),
            format!("{} min", settings.time_based_interval),
        ]);
        table.push([
            "app detection".to_string(),
            if settings.app_detection_enabled { "on" } else { "off" }.to_string(),
        ]);
        table.write_to(&mut out)
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color || !io::stdout().is_terminal() {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

fn short_id(id: &str) -> &str {
    match id.char_indices().nth(ID_PREVIEW) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

/// Left-aligned text table that measures cells without their ANSI codes.
struct Table<const N: usize> {
    headers: [String; N],
    rows: Vec<[String; N]>,
}

impl<const N: usize> Table<N> {
    fn new(headers: [&str; N]) -> Self {
        Self {
            headers: headers.map(str::to_string),
            rows: Vec::new(),
        }
    }

    fn push(&mut self, row: [String; N]) {
        self.rows.push(row);
    }

    fn write_to<W: Write>(&self, mut out: W) -> anyhow::Result<()> {
        let mut widths = self.headers.clone().map(|h| visible_width(&h));
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(visible_width(cell));
            }
        }

        let write_row = |out: &mut W, cells: &[String; N]| -> io::Result<()> {
            for (cell, width) in cells.iter().zip(widths) {
                let pad = width.saturating_sub(visible_width(cell));
                write!(out, "{cell}{} ", " ".repeat(pad))?;
            }
            writeln!(out)
        };

        write_row(&mut out, &self.headers)?;
        let rule = widths.map(|w| "-".repeat(w));
        write_row(&mut out, &rule)?;
        for row in &self.rows {
            write_row(&mut out, row)?;
        }
        Ok(())
    }
}

fn visible_width(s: &str) -> usize {
    UnicodeWidthStr::width(strip_ansi(s).as_str())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;
    for ch in s.chars() {
        match (escaped, ch) {
            (true, 'm') => escaped = false,
            (true, _) => {}
            (false, '\x1b') => escaped = true,
            (false, _) => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::{Renderer, short_id, strip_ansi};
    use crate::config::Config;
    use crate::index::DayBucket;
    use crate::todo::Todo;

    #[test]
    fn day_view_lists_open_then_done() {
        let now = Utc
            .with_ymd_and_hms(2026, 4, 2, 9, 0, 0)
            .single()
            .expect("valid now");
        let tz = chrono_tz::UTC;
        let open = Todo::new("buy milk".to_string(), now, 1, now, &tz);
        let mut done = Todo::new("call mom".to_string(), now, 2, now, &tz);
        done.done = true;
        let bucket = DayBucket {
            incomplete: vec![open],
            completed: vec![done],
        };

        let renderer = Renderer::new(&Config::default()).expect("renderer");
        let mut buf = Vec::new();
        let day = NaiveDate::from_ymd_opt(2026, 4, 2).expect("valid day");
        renderer.write_day(&mut buf, day, &bucket).expect("render");
        let text = strip_ansi(&String::from_utf8(buf).expect("utf8"));

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "2026-04-02");
        assert!(lines[3].contains("buy milk"));
        assert!(lines[4].contains("call mom"));
        assert!(lines[4].starts_with('✓'));
    }

    #[test]
    fn empty_day_says_so() {
        let renderer = Renderer::new(&Config::default()).expect("renderer");
        let mut buf = Vec::new();
        let day = NaiveDate::from_ymd_opt(2026, 4, 3).expect("valid day");
        renderer
            .write_day(&mut buf, day, &DayBucket::default())
            .expect("render");
        assert!(String::from_utf8(buf).expect("utf8").contains("nothing planned"));
    }

    #[test]
    fn ids_are_shortened_on_char_boundaries() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
