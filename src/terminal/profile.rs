//! Per-agent marker profiles
//!
//! Each known CLI agent UI is described as data: an ordered table of
//! (pattern, marker) rules. New agent UIs are added by table, not by
//! branching. Unknown agents degrade to raw-text passthrough.

use once_cell::sync::Lazy;
use regex::Regex;

/// Logical marker a buffer line can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Session banner; emits a system "cli:start"
    Banner,
    /// Start of a user prompt; capture group 1 is the prompt text
    PromptStart,
    /// Continuation line of a boxed/wrapped user prompt
    PromptContinuation,
    /// Start of an assistant response; capture group 1 is leading text
    ResponseStart,
    /// Interruption marker; emits a system "cli:interrupted"
    Interrupt,
    /// Bottom status line; everything below is live input chrome
    StatusLine,
}

pub struct MarkerRule {
    pub pattern: Regex,
    pub marker: Marker,
}

impl MarkerRule {
    fn new(pattern: &str, marker: Marker) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("profile pattern must compile"),
            marker,
        }
    }
}

pub struct AgentProfile {
    pub name: &'static str,
    /// Evaluated in order; first match wins
    pub rules: Vec<MarkerRule>,
    /// Raw-text fallback: the whole buffer becomes one system message
    pub passthrough: bool,
}

impl AgentProfile {
    /// Classify a line; returns the marker and the captured content (empty
    /// when the rule has no capture group).
    pub fn classify(&self, line: &str) -> Option<(Marker, String)> {
        for rule in &self.rules {
            if let Some(caps) = rule.pattern.captures(line) {
                let content = caps
                    .get(1)
                    .map(|m| m.as_str().trim_end().to_string())
                    .unwrap_or_default();
                return Some((rule.marker, content));
            }
        }
        None
    }
}

/// Shell prompt after CLI exit; capture group 1 is the typed command.
pub static SHELL_PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\$|[\w.-]+@[\w.-]+[^$#%\n]*[$#%])\s?(.*)$").unwrap()
});

static CLAUDE: Lazy<AgentProfile> = Lazy::new(|| AgentProfile {
    name: "claude",
    passthrough: false,
    rules: vec![
        MarkerRule::new(r"^\s*[✻✳]\s+Welcome to Claude", Marker::Banner),
        MarkerRule::new(r"^\s*⎿?\s*Interrupted by user\s*$", Marker::Interrupt),
        MarkerRule::new(r"^\?\s+for shortcuts|esc to interrupt\s*$", Marker::StatusLine),
        MarkerRule::new(r"^⏺\s?(.*)$", Marker::ResponseStart),
        MarkerRule::new(r"^>\s?(.*)$", Marker::PromptStart),
    ],
});

static GEMINI: Lazy<AgentProfile> = Lazy::new(|| AgentProfile {
    name: "gemini",
    passthrough: false,
    rules: vec![
        MarkerRule::new(r"(?i)^\s*gemini cli\b", Marker::Banner),
        MarkerRule::new(r"(?i)^\s*request cancelled", Marker::Interrupt),
        MarkerRule::new(r"(?i)no sandbox|gemini-\d[\w.-]*\s*\(", Marker::StatusLine),
        MarkerRule::new(r"^✦\s?(.*)$", Marker::ResponseStart),
        MarkerRule::new(r"^│\s*>\s?(.*?)\s*│?\s*$", Marker::PromptStart),
        MarkerRule::new(r"^│\s?(.*?)\s*│\s*$", Marker::PromptContinuation),
    ],
});

static CODEX: Lazy<AgentProfile> = Lazy::new(|| AgentProfile {
    name: "codex",
    passthrough: false,
    rules: vec![
        MarkerRule::new(r"(?i)^\s*(?:╭.*)?OpenAI Codex\b", Marker::Banner),
        MarkerRule::new(r"(?i)^\s*task aborted", Marker::Interrupt),
        MarkerRule::new(r"^\s*⏎ send\b", Marker::StatusLine),
        MarkerRule::new(r"^codex\s*$", Marker::ResponseStart),
        MarkerRule::new(r"^user\s*$", Marker::PromptStart),
    ],
});

static UNKNOWN: Lazy<AgentProfile> = Lazy::new(|| AgentProfile {
    name: "unknown",
    passthrough: true,
    rules: Vec::new(),
});

/// Look up the profile for an agent hint; unknown hints get passthrough.
pub fn profile_for(agent: &str) -> &'static AgentProfile {
    match agent.to_lowercase().as_str() {
        "claude" => &CLAUDE,
        "gemini" => &GEMINI,
        "codex" => &CODEX,
        _ => &UNKNOWN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claude_markers() {
        let p = profile_for("claude");
        assert_eq!(
            p.classify("✻ Welcome to Claude Code!").map(|c| c.0),
            Some(Marker::Banner)
        );
        assert_eq!(
            p.classify("> fix the parser"),
            Some((Marker::PromptStart, "fix the parser".into()))
        );
        assert_eq!(
            p.classify("⏺ Looking at parser.rs"),
            Some((Marker::ResponseStart, "Looking at parser.rs".into()))
        );
        assert_eq!(
            p.classify("? for shortcuts").map(|c| c.0),
            Some(Marker::StatusLine)
        );
        assert_eq!(p.classify("plain continuation line"), None);
    }

    #[test]
    fn test_gemini_boxed_prompt() {
        let p = profile_for("gemini");
        assert_eq!(
            p.classify("│ > summarize this repo │"),
            Some((Marker::PromptStart, "summarize this repo".into()))
        );
        assert_eq!(
            p.classify("│ and include the README │"),
            Some((Marker::PromptContinuation, "and include the README".into()))
        );
        assert_eq!(p.classify("✦ Sure.").map(|c| c.0), Some(Marker::ResponseStart));
    }

    #[test]
    fn test_unknown_is_passthrough() {
        let p = profile_for("some-new-agent");
        assert!(p.passthrough);
        assert_eq!(p.classify("anything"), None);
    }

    #[test]
    fn test_shell_prompt_captures_command() {
        let caps = SHELL_PROMPT.captures("dev@box:~/proj$ git status").unwrap();
        assert_eq!(&caps[1], "git status");
        let caps = SHELL_PROMPT.captures("$ ls -la").unwrap();
        assert_eq!(&caps[1], "ls -la");
        assert!(SHELL_PROMPT.captures("  indented $ not a prompt").is_none());
    }
}
