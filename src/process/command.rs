//! Launch invocation construction for the agent runner.

use std::path::Path;

/// Escape backslashes and double quotes so a path can be embedded in the
/// runner expression, tolerating spaces and special characters.
pub fn escape_for_embedding(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Program and arguments for one agent server process.
///
/// The runner is invoked directly, not through a shell, so the expression
/// travels as a single argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchInvocation {
    /// Build the `<runtime> -e "require('<runner>').runServer('<config>', <port>)"`
    /// invocation. This is the entire contract with the agent server program;
    /// its output is never parsed.
    pub fn for_agent_server(
        runtime: &str,
        runner_path: &str,
        config_path: &Path,
        port: u16,
    ) -> Self {
        let expression = format!(
            "require('{}').runServer('{}', {})",
            escape_for_embedding(runner_path),
            escape_for_embedding(&config_path.display().to_string()),
            port
        );
        Self {
            program: runtime.to_string(),
            args: vec!["-e".to_string(), expression],
        }
    }

    /// Single-line rendering for logs. Arguments with spaces or quotes are
    /// wrapped as-is; their quotes were already escaped when the expression
    /// was built.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('"') {
                line.push_str(&format!(" \"{}\"", arg));
            } else {
                line.push_str(&format!(" {}", arg));
            }
        }
        line
    }
}
