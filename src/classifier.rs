//! Input classifier: shell, control, or agent
//!
//! Decides the execution route for a raw input line. Control commands are a
//! closed set matched exactly. Shell detection is a heuristic, not a shell
//! grammar: the head token must name something executable and the arguments
//! must look like shell arguments rather than prose. Everything ambiguous
//! falls through to the agent route, which always produces some
//! interpretation, so misclassification here is never an error.

use crate::session::SessionState;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// Member of the closed control-command set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// End the session loop
    Exit,
    /// Presentation-only screen clear
    Clear,
    /// Drop the in-memory conversation transcript (durable memory untouched)
    Reset,
}

/// Classification result: route plus normalized payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Shell { command: String },
    Control(ControlCommand),
    Agent { prompt: String },
}

/// Shell builtins accepted even though they are not PATH binaries
static SHELL_BUILTINS: &[&str] = &[
    "cd", "pwd", "echo", "export", "source", "alias", "unalias", "history", "jobs", "fg", "bg",
    "kill", "wait", "exec", "eval", "test", "[", "printf", "read", "set", "unset", "shift",
    "return", "break", "continue", "which", "type", "command", "builtin", "declare", "local",
    "readonly", "true", "false",
];

/// Argument patterns that are common in prose and nearly absent from real
/// shell invocations. One hit pushes the line to the agent route.
static NATURAL_LANGUAGE_INDICATORS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\b(better|worse|best|worst)\s+(than|of)\b",
        r"\bcompared?\s+to\b",
        r"\bis\s+(the|this|that|a|an)\b",
        r"\bare\s+(the|these|those)\b",
        r"\bwhich\s+(one|is|are)\b",
        r"\b(can|could|should|would)\s+you\b",
        r"\bplease\s+(help|tell|show|run)\b",
        r"\btell\s+me\s+about\b",
        r"\bhelp\s+me\s+(with|understand)\b",
        r"\bthe\s+(latest|newest|oldest|current|main|primary|best|file|directory|process|version|service|system)\b",
        r"\ba\s+(new|good|bad|better|simple|useful)\b",
        r"\bhow\s+(to|do|does)\b",
        r"\bwhat\s+(is|are|does)\b",
        r"\bwhy\s+(is|are|does)\b",
        r"\bthis\s+(command|file|directory)\b",
        r"\bthat\s+(command|file|directory)\b",
        r"\ball\s+\w+\s+(files|directories|commands)\b",
        r"\bmy\s+(project|files|system|directory)\b",
        r"\bof\s+(my|the|this|that)\b",
        r"\bto\s+(the|my|someone)\b",
        r"\b(contents|special|running|installed|available|useful)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

static COMMON_ENGLISH_WORDS: &[&str] = &[
    "the", "is", "are", "and", "or", "but", "for", "to", "of", "in", "on", "at", "by", "with",
];

/// Route classifier with a startup-scanned table of available commands
pub struct InputClassifier {
    known_commands: HashSet<String>,
}

impl InputClassifier {
    /// Build the classifier, learning available binaries from PATH
    pub fn new() -> Self {
        let known_commands = scan_path_commands();
        debug!("Classifier loaded {} PATH commands", known_commands.len());
        Self { known_commands }
    }

    /// Build with an explicit command table (tests, constrained environments)
    pub fn with_commands<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known_commands: commands.into_iter().map(Into::into).collect(),
        }
    }

    /// Classify one input line. Pure: no side effects on session state.
    pub fn classify(&self, input: &str, session: &SessionState) -> Classification {
        let trimmed = input.trim();

        match trimmed.to_lowercase().as_str() {
            "exit" => return Classification::Control(ControlCommand::Exit),
            "clear" => return Classification::Control(ControlCommand::Clear),
            "reset" => return Classification::Control(ControlCommand::Reset),
            _ => {}
        }

        if self.is_shell_command(trimmed, session) {
            Classification::Shell {
                command: trimmed.to_string(),
            }
        } else {
            Classification::Agent {
                prompt: trimmed.to_string(),
            }
        }
    }

    /// Command suggestions for a partial head token, sorted, bounded
    pub fn command_suggestions(&self, partial: &str) -> Vec<String> {
        if partial.is_empty() {
            return Vec::new();
        }
        let mut suggestions: Vec<String> = self
            .known_commands
            .iter()
            .filter(|cmd| cmd.starts_with(partial))
            .cloned()
            .collect();
        suggestions.sort();
        suggestions.truncate(10);
        suggestions
    }

    fn is_shell_command(&self, input: &str, session: &SessionState) -> bool {
        if input.is_empty() {
            return false;
        }

        if is_obvious_natural_language(input) {
            return false;
        }

        // Invalid shell syntax (unbalanced quotes) cannot be a command
        let tokens = match shell_words::split(input) {
            Ok(tokens) if !tokens.is_empty() => tokens,
            _ => return false,
        };

        if !self.is_valid_command(&tokens[0], session) {
            return false;
        }

        args_follow_shell_patterns(&tokens[1..])
    }

    fn is_valid_command(&self, command: &str, session: &SessionState) -> bool {
        if SHELL_BUILTINS.contains(&command) {
            return true;
        }

        if self.known_commands.contains(command) {
            return true;
        }

        // Relative invocations are checked against the session directory;
        // absolute or slash-qualified names are taken at face value.
        if command.starts_with("./") || command.starts_with("../") {
            return session.cwd().join(command).exists();
        }
        if command.starts_with('/') || command.contains('/') {
            return true;
        }

        false
    }
}

impl Default for InputClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Quick pre-check for inputs that read as prose regardless of their head
fn is_obvious_natural_language(input: &str) -> bool {
    let lower = input.to_lowercase();

    if lower.ends_with('?') {
        return true;
    }

    const QUESTION_STARTERS: &[&str] = &["what ", "how ", "why ", "when ", "where ", "who "];
    if QUESTION_STARTERS.iter().any(|s| lower.starts_with(s)) {
        return true;
    }

    const CONVERSATIONAL_STARTERS: &[&str] =
        &["tell me", "can you", "could you", "please ", "i want", "i need"];
    CONVERSATIONAL_STARTERS.iter().any(|s| lower.starts_with(s))
}

/// Shell arguments are flags, paths, and short values; prose is none of those
fn args_follow_shell_patterns(args: &[String]) -> bool {
    if args.is_empty() {
        return true;
    }

    let combined = args.join(" ").to_lowercase();

    if NATURAL_LANGUAGE_INDICATORS
        .iter()
        .any(|re| re.is_match(&combined))
    {
        return false;
    }

    // Long bare arguments that are neither paths nor flags read as prose
    for arg in args {
        if arg.len() > 40 && !(arg.contains('/') || arg.contains('.') || arg.starts_with('-')) {
            return false;
        }
    }

    // Runs of short bare words are sentence fragments, not arguments
    let short_words = args
        .iter()
        .filter(|a| a.len() <= 3 && !a.starts_with('-'))
        .count();
    if short_words > 3 {
        return false;
    }

    let words: Vec<&str> = combined.split_whitespace().collect();
    if words.len() > 2 {
        let common = words
            .iter()
            .filter(|w| COMMON_ENGLISH_WORDS.contains(*w))
            .count();
        if common as f32 / words.len() as f32 > 0.4 {
            return false;
        }
    }

    true
}

/// Load executable names from every PATH directory
fn scan_path_commands() -> HashSet<String> {
    let mut commands = HashSet::new();
    let Some(path_env) = std::env::var_os("PATH") else {
        return commands;
    };

    for dir in std::env::split_paths(&path_env) {
        load_commands_from_dir(&dir, &mut commands);
    }
    commands
}

fn load_commands_from_dir(dir: &Path, commands: &mut HashSet<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && is_executable(&path) {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                commands.insert(name.to_string());
            }
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn classifier() -> InputClassifier {
        InputClassifier::with_commands([
            "ls", "git", "docker", "grep", "ps", "curl", "echo", "cat", "find", "kubectl", "aws",
            "python3", "rm", "chmod", "ssh", "date", "man",
        ])
    }

    fn session() -> SessionState {
        SessionState::with_cwd(PathBuf::from("/tmp"))
    }

    fn route_of(input: &str) -> Classification {
        classifier().classify(input, &session())
    }

    #[test]
    fn test_control_commands_exact_match() {
        assert_eq!(
            route_of("exit"),
            Classification::Control(ControlCommand::Exit)
        );
        assert_eq!(
            route_of("  CLEAR  "),
            Classification::Control(ControlCommand::Clear)
        );
        assert_eq!(
            route_of("reset"),
            Classification::Control(ControlCommand::Reset)
        );
        // Prefixed forms are not control commands
        assert!(matches!(route_of("exit the program"), Classification::Agent { .. }));
    }

    #[test]
    fn test_valid_shell_commands() {
        for input in [
            "ls -la",
            "echo 'Hello World'",
            "cd /usr/local/bin",
            "pwd",
            "rm -rf /tmp/test",
            "git commit -m 'Initial commit'",
            "python3 script.py",
            "docker ps -a",
            "kubectl get pods",
            "aws s3 ls",
            "find . -name '*.py'",
            "grep pattern file",
            "chmod +x script.sh",
            "ps aux | grep python",
            "ssh user@server",
            "date +%Y-%m-%d",
            "man grep",
            "grep 'what' file.txt",
        ] {
            assert!(
                matches!(route_of(input), Classification::Shell { .. }),
                "expected shell: {:?}",
                input
            );
        }
    }

    #[test]
    fn test_natural_language_goes_to_agent() {
        for input in [
            "what is the weather today?",
            "tell me a joke",
            "which is better, GCP or AWS?",
            "find all python files",
            "how do I use grep?",
            "help me with git",
            "show me the best practices",
            "List all my GCP projects",
        ] {
            assert!(
                matches!(route_of(input), Classification::Agent { .. }),
                "expected agent: {:?}",
                input
            );
        }
    }

    #[test]
    fn test_command_words_in_prose_go_to_agent() {
        for input in [
            "copy all files to the backup directory",
            "delete that old file",
            "git status of my project",
            "cat the file contents",
            "echo is a useful command",
            "kill the running process",
            "date with someone special",
        ] {
            assert!(
                matches!(route_of(input), Classification::Agent { .. }),
                "expected agent: {:?}",
                input
            );
        }
    }

    #[test]
    fn test_unknown_head_token_goes_to_agent() {
        assert!(matches!(
            route_of("frobnicate --all"),
            Classification::Agent { .. }
        ));
    }

    #[test]
    fn test_unbalanced_quotes_go_to_agent() {
        assert!(matches!(
            route_of("echo 'unterminated"),
            Classification::Agent { .. }
        ));
    }

    #[test]
    fn test_slash_qualified_commands_are_shell() {
        assert!(matches!(
            route_of("/usr/bin/env python3"),
            Classification::Shell { .. }
        ));
    }

    #[test]
    fn test_command_suggestions_prefix_sorted() {
        let c = classifier();
        let suggestions = c.command_suggestions("g");
        assert_eq!(suggestions, vec!["git".to_string(), "grep".to_string()]);
        assert!(c.command_suggestions("").is_empty());
    }
}
