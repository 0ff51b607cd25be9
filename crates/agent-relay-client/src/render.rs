//! Incremental terminal rendering of a [`Transcript`].

use std::io::{self, Write};

use crate::transcript::{Entry, EntryKind, Role, ToolStatus, Transcript};

const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Longest tool output line shown before truncation.
const TOOL_OUTPUT_PREVIEW_CHARS: usize = 120;

#[derive(Debug, Default, Clone)]
struct Printed {
    /// Bytes of `content` already written.
    content_len: usize,
    tool_done: bool,
}

/// Prints transcript changes as they happen.
///
/// Open entries only ever grow at the end, so each call writes the new suffix
/// of every entry plus the header of any entry it has not seen yet.
#[derive(Debug)]
pub struct TerminalRenderer {
    printed: Vec<Printed>,
    show_thinking: bool,
    color: bool,
}

impl TerminalRenderer {
    pub fn new(show_thinking: bool, color: bool) -> Self {
        Self {
            printed: Vec::new(),
            show_thinking,
            color,
        }
    }

    pub fn render(&mut self, transcript: &Transcript, out: &mut impl Write) -> io::Result<()> {
        for (index, entry) in transcript.entries().iter().enumerate() {
            if index >= self.printed.len() {
                self.printed.push(Printed::default());
                self.header(entry, out)?;
            }
            let printed = &mut self.printed[index];

            match entry.kind {
                EntryKind::Text => {
                    // User text is printed whole by the header.
                    if entry.role != Role::User
                        && let Some(suffix) = entry.content.get(printed.content_len..) {
                        out.write_all(suffix.as_bytes())?;
                    }
                    printed.content_len = entry.content.len();
                }
                EntryKind::Thinking => {
                    if self.show_thinking
                        && let Some(suffix) = entry.content.get(printed.content_len..)
                        && !suffix.is_empty()
                    {
                        write_styled(out, self.color, DIM, suffix)?;
                    }
                    printed.content_len = entry.content.len();
                }
                EntryKind::ToolUse => {
                    if let Some(tool) = &entry.tool
                        && !printed.tool_done
                        && tool.status != ToolStatus::Running
                    {
                        printed.tool_done = true;
                        let output = tool.output.as_deref().unwrap_or_default();
                        let summary = summarize_output(output);
                        if tool.status == ToolStatus::Error {
                            write_styled(out, self.color, RED, &format!("  ⎿ {summary}"))?;
                            writeln!(out)?;
                        } else {
                            writeln!(out, "  ⎿ {summary}")?;
                        }
                    }
                }
                EntryKind::Error | EntryKind::System => {}
            }
        }
        out.flush()
    }

    fn header(&self, entry: &Entry, out: &mut impl Write) -> io::Result<()> {
        match (entry.kind, entry.role) {
            (EntryKind::Text, Role::User) => {
                writeln!(out, "> {}", entry.content)?;
                writeln!(out)
            }
            (EntryKind::Text, _) => Ok(()),
            (EntryKind::Thinking, _) => {
                if self.show_thinking {
                    write_styled(out, self.color, DIM, "✻ ")?;
                }
                Ok(())
            }
            (EntryKind::ToolUse, _) => {
                let Some(tool) = &entry.tool else {
                    return Ok(());
                };
                writeln!(out)?;
                writeln!(out, "● {}({})", tool.name, summarize_input(&tool.input))
            }
            (EntryKind::Error, _) => {
                writeln!(out)?;
                write_styled(out, self.color, RED, &format!("Error: {}", entry.content))?;
                writeln!(out)
            }
            (EntryKind::System, _) => {
                writeln!(out)?;
                write_styled(out, self.color, DIM, &format!("[{}]", entry.content))?;
                writeln!(out)
            }
        }
    }
}

fn write_styled(out: &mut impl Write, color: bool, style: &str, text: &str) -> io::Result<()> {
    if color {
        write!(out, "{style}{text}{RESET}")
    } else {
        write!(out, "{text}")
    }
}

fn summarize_input(input: &serde_json::Value) -> String {
    let text = match input {
        serde_json::Value::Object(map) if map.len() == 1 => map
            .values()
            .next()
            .map(|value| match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    };
    truncate(&text)
}

fn summarize_output(output: &str) -> String {
    let mut lines = output.lines();
    let first = lines.next().unwrap_or("(no output)");
    let rest = lines.count();
    if rest == 0 {
        truncate(first)
    } else {
        format!("{} (+{} lines)", truncate(first), rest)
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= TOOL_OUTPUT_PREVIEW_CHARS {
        text.to_string()
    } else {
        let cut: String = text.chars().take(TOOL_OUTPUT_PREVIEW_CHARS).collect();
        format!("{cut}...")
    }
}
