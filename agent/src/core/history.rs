//! Plain-text renderings of executed work for prompt inputs.

use crate::core::types::{InvalidCommand, ToolResult};

/// Render a command history as markdown, one fenced block per invocation.
///
/// Carriage returns from pty-style output are stripped.
pub fn render_cmd_history(history: &[ToolResult]) -> String {
    history
        .iter()
        .map(|entry| {
            let result = entry.result.replace('\r', "");
            format!(
                "## Tool call: {}\n\n```bash\n$ {}\n\n{}\n```\n",
                entry.tool,
                entry.cmd,
                result.trim_end()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render known-invalid commands as a markdown list.
pub fn render_invalid_commands(commands: &[InvalidCommand]) -> String {
    commands
        .iter()
        .map(|cmd| {
            format!(
                "- `{}`: {} (instead use `{}`)",
                cmd.command, cmd.problem, cmd.fixed_command
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Merge `incoming` into `known`, skipping commands already recorded.
///
/// Returns the number of commands added.
pub fn remember_invalid_commands(
    known: &mut Vec<InvalidCommand>,
    incoming: &[InvalidCommand],
) -> usize {
    let mut added = 0;
    for cmd in incoming {
        let command = cmd.command.trim();
        if command.is_empty() || known.iter().any(|k| k.command.trim() == command) {
            continue;
        }
        known.push(cmd.clone());
        added += 1;
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid(command: &str) -> InvalidCommand {
        InvalidCommand {
            command: command.to_string(),
            problem: "nxc: wrong separator".to_string(),
            fixed_command: "nxc smb 10.0.0.1 -u a b".to_string(),
        }
    }

    #[test]
    fn history_strips_carriage_returns() {
        let history = vec![ToolResult {
            tool: "execute_command".to_string(),
            cmd: "id".to_string(),
            finished: true,
            result: "uid=0(root)\r\n".to_string(),
        }];
        let rendered = render_cmd_history(&history);
        assert!(rendered.contains("$ id\n\nuid=0(root)\n```"));
        assert!(!rendered.contains('\r'));
    }

    #[test]
    fn remember_skips_duplicates_and_blank_commands() {
        let mut known = vec![invalid("nxc smb a,b")];
        let added = remember_invalid_commands(
            &mut known,
            &[invalid(" nxc smb a,b "), invalid(""), invalid("nmap 1,2")],
        );
        assert_eq!(added, 1);
        assert_eq!(known.len(), 2);
        assert!(render_invalid_commands(&known).contains("`nmap 1,2`"));
    }
}
