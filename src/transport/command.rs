//! Remote command and environment construction.

use crate::env;
use std::borrow::Cow;
use std::collections::HashMap;

/// Wrap a command line in a login shell, changing into `working_directory`
/// first when given.
pub fn build_command(command: &str, working_directory: Option<&str>) -> Vec<String> {
    let script = match working_directory {
        Some(dir) => format!(
            "cd {} && {}",
            shell_escape::unix::escape(Cow::Borrowed(dir)),
            command
        ),
        None => command.to_string(),
    };

    vec![
        "sh".to_string(),
        "-l".to_string(),
        "-c".to_string(),
        script,
    ]
}

/// Environment every exec session gets.
pub fn base_environment(workspace: &str) -> HashMap<String, String> {
    HashMap::from([
        ("HOME".to_string(), workspace.to_string()),
        ("TERM".to_string(), env::host::TERM.to_string()),
    ])
}

/// Merge caller-provided variables with the base environment. Base values
/// take precedence.
pub fn merge_env(caller: &HashMap<String, String>, workspace: &str) -> HashMap<String, String> {
    let mut merged = caller.clone();
    merged.extend(base_environment(workspace));
    merged
}
