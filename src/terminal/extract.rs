//! Terminal snapshot extractor
//!
//! Pure function from a rendered terminal buffer + agent profile to an
//! ordered candidate message list. Lines accumulate into the open message
//! until the next marker; when a marker interrupts accumulation the open
//! message is flushed and the marker line is re-evaluated as the start of
//! the next message.

use crate::session::{Message, Role};
use crate::terminal::ansi::strip_ansi;
use crate::terminal::profile::{AgentProfile, Marker, SHELL_PROMPT};

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateMessage {
    pub role: Role,
    pub text: String,
}

impl CandidateMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn to_message(&self) -> Message {
        Message::text(self.role, self.text.clone())
    }
}

/// System markers emitted for CLI lifecycle transitions
const CLI_START: &str = "cli:start";
const CLI_INTERRUPTED: &str = "cli:interrupted";
const CLI_EXIT: &str = "cli:exit";

pub fn extract_messages(buffer: &str, profile: &AgentProfile) -> Vec<CandidateMessage> {
    let clean = strip_ansi(buffer);
    if clean.trim().is_empty() {
        return Vec::new();
    }
    if profile.passthrough {
        return vec![CandidateMessage::new(Role::System, clean.trim())];
    }

    let lines: Vec<&str> = clean.lines().collect();
    let mut out: Vec<CandidateMessage> = Vec::new();
    let mut open: Option<(Role, Vec<String>)> = None;
    let mut shell_mode = false;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let marker = profile.classify(line);
        let shell = SHELL_PROMPT.captures(line);

        // A marker or shell prompt terminates the open message; flush and
        // re-evaluate this line with nothing open.
        if open.is_some() && (boundary(marker.as_ref().map(|m| m.0)) || shell.is_some()) {
            flush(&mut open, &mut out);
            continue;
        }

        if shell_mode {
            // Past CLI exit only literal shell commands are recorded.
            if let Some(caps) = shell {
                let command = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
                if !command.is_empty() {
                    out.push(CandidateMessage::new(Role::System, command));
                }
            }
            i += 1;
            continue;
        }

        if let Some(caps) = shell {
            out.push(CandidateMessage::new(Role::System, CLI_EXIT));
            shell_mode = true;
            let command = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            if !command.is_empty() {
                out.push(CandidateMessage::new(Role::System, command));
            }
            i += 1;
            continue;
        }

        match marker {
            Some((Marker::StatusLine, _)) => break,
            Some((Marker::Banner, _)) => {
                out.push(CandidateMessage::new(Role::System, CLI_START));
            }
            Some((Marker::Interrupt, _)) => {
                out.push(CandidateMessage::new(Role::System, CLI_INTERRUPTED));
            }
            Some((Marker::PromptStart, content)) => {
                open = Some((Role::User, vec![content]));
            }
            Some((Marker::ResponseStart, content)) => {
                let seed = if content.is_empty() { Vec::new() } else { vec![content] };
                open = Some((Role::Assistant, seed));
            }
            Some((Marker::PromptContinuation, content)) => {
                if let Some((Role::User, body)) = &mut open {
                    body.push(content);
                }
                // A continuation with no open prompt is chrome; skip it.
            }
            None => {
                if let Some((_, body)) = &mut open {
                    body.push(line.trim_end().to_string());
                }
            }
        }
        i += 1;
    }

    flush(&mut open, &mut out);
    out
}

fn boundary(marker: Option<Marker>) -> bool {
    matches!(
        marker,
        Some(
            Marker::Banner
                | Marker::PromptStart
                | Marker::ResponseStart
                | Marker::Interrupt
                | Marker::StatusLine
        )
    )
}

fn flush(open: &mut Option<(Role, Vec<String>)>, out: &mut Vec<CandidateMessage>) {
    if let Some((role, body)) = open.take() {
        let text = body.join("\n").trim().to_string();
        if !text.is_empty() {
            out.push(CandidateMessage::new(role, text));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::profile::profile_for;

    fn roles_and_texts(candidates: &[CandidateMessage]) -> Vec<(Role, &str)> {
        candidates.iter().map(|c| (c.role, c.text.as_str())).collect()
    }

    #[test]
    fn test_claude_full_screen() {
        let buffer = "\
✻ Welcome to Claude Code!

> fix the bug in parser.rs

⏺ I'll look at parser.rs now.
  The issue is an off-by-one in the loop.

> thanks

⏺ Done. The fix is committed.

? for shortcuts";
        let candidates = extract_messages(buffer, profile_for("claude"));
        assert_eq!(
            roles_and_texts(&candidates),
            vec![
                (Role::System, "cli:start"),
                (Role::User, "fix the bug in parser.rs"),
                (
                    Role::Assistant,
                    "I'll look at parser.rs now.\n  The issue is an off-by-one in the loop."
                ),
                (Role::User, "thanks"),
                (Role::Assistant, "Done. The fix is committed."),
            ]
        );
    }

    #[test]
    fn test_status_line_cuts_live_chrome() {
        let buffer = "⏺ Answer.\n? for shortcuts\n> half-typed inpu";
        let candidates = extract_messages(buffer, profile_for("claude"));
        assert_eq!(roles_and_texts(&candidates), vec![(Role::Assistant, "Answer.")]);
    }

    #[test]
    fn test_interrupt_marker() {
        let buffer = "> run the tests\n⎿ Interrupted by user\n";
        let candidates = extract_messages(buffer, profile_for("claude"));
        assert_eq!(
            roles_and_texts(&candidates),
            vec![(Role::User, "run the tests"), (Role::System, "cli:interrupted")]
        );
    }

    #[test]
    fn test_shell_exit_records_commands() {
        let buffer = "⏺ Bye!\ndev@box:~/proj$ git status\ndev@box:~/proj$ cargo test\ndev@box:~/proj$ ";
        let candidates = extract_messages(buffer, profile_for("claude"));
        assert_eq!(
            roles_and_texts(&candidates),
            vec![
                (Role::Assistant, "Bye!"),
                (Role::System, "cli:exit"),
                (Role::System, "git status"),
                (Role::System, "cargo test"),
            ]
        );
    }

    #[test]
    fn test_gemini_boxed_prompt_spans_lines() {
        let buffer = "\
│ > summarize this repo │
│ and include the README │
✦ It's a parser library.";
        let candidates = extract_messages(buffer, profile_for("gemini"));
        assert_eq!(
            roles_and_texts(&candidates),
            vec![
                (Role::User, "summarize this repo\nand include the README"),
                (Role::Assistant, "It's a parser library."),
            ]
        );
    }

    #[test]
    fn test_unknown_profile_passthrough() {
        let buffer = "any old text\nwith two lines";
        let candidates = extract_messages(buffer, profile_for("mystery"));
        assert_eq!(
            roles_and_texts(&candidates),
            vec![(Role::System, "any old text\nwith two lines")]
        );
    }

    #[test]
    fn test_blank_buffer_yields_nothing() {
        assert!(extract_messages("   \n\n  ", profile_for("claude")).is_empty());
        assert!(extract_messages("\x1b[2J\x1b[H", profile_for("claude")).is_empty());
    }

    #[test]
    fn test_ansi_noise_is_stripped() {
        let buffer = "\x1b[1m> \x1b[0mhello there\n\x1b[32m⏺\x1b[0m hi!";
        let candidates = extract_messages(buffer, profile_for("claude"));
        assert_eq!(
            roles_and_texts(&candidates),
            vec![(Role::User, "hello there"), (Role::Assistant, "hi!")]
        );
    }
}
