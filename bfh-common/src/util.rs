//! Command rendering and log redaction.

use std::borrow::Cow;

/// Environment assignments and flags whose values must never be logged.
const SENSITIVE_PREFIXES: &[&str] = &[
    "VAULT_TOKEN=",
    "AWS_SECRET_ACCESS_KEY=",
    "AWS_SESSION_TOKEN=",
    "AWS_ACCESS_KEY_ID=",
    "GITHUB_TOKEN=",
    "REGISTRY_PASSWORD=",
    "PASSWORD=",
    "SECRET=",
    "TOKEN=",
    "--token=",
    "--token ",
    "--password=",
    "--password ",
];

/// Length of the value that starts at the beginning of `s`.
///
/// A value ends at the first unquoted, unescaped whitespace.
fn value_len(s: &str) -> usize {
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (idx, c) in s.char_indices() {
        match (escaped, quote, c) {
            (true, _, _) => escaped = false,
            (false, _, '\\') => escaped = true,
            (false, Some(q), c) if c == q => quote = None,
            (false, Some(_), _) => {}
            (false, None, '"' | '\'') => quote = Some(c),
            (false, None, c) if c.is_whitespace() => return idx,
            _ => {}
        }
    }
    s.len()
}

/// Replace the values of sensitive assignments and flags with `***`.
pub fn mask_sensitive_command(cmd: &str) -> String {
    let mut result = cmd.to_string();
    for prefix in SENSITIVE_PREFIXES {
        let mut from = 0;
        while let Some(found) = result[from..].find(prefix) {
            let value_start = from + found + prefix.len();
            let value_end = value_start + value_len(&result[value_start..]);
            result.replace_range(value_start..value_end, "***");
            from = value_start + 3;
            if from >= result.len() {
                break;
            }
        }
    }
    result
}

/// Render a command line the way a shell user would type it.
pub fn render_command<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let mut parts: Vec<Cow<'_, str>> = Vec::with_capacity(args.len() + 1);
    parts.push(shell_escape::escape(Cow::Borrowed(program)));
    for arg in args {
        parts.push(shell_escape::escape(Cow::Borrowed(arg.as_ref())));
    }
    parts.join(" ")
}

/// Render a command with its environment prefix, masked for logging.
pub fn render_for_log<S: AsRef<str>>(
    env: &[(String, String)],
    program: &str,
    args: &[S],
) -> String {
    let mut line = String::new();
    for (key, value) in env {
        line.push_str(key);
        line.push('=');
        line.push_str(&shell_escape::escape(Cow::Borrowed(value.as_str())));
        line.push(' ');
    }
    line.push_str(&render_command(program, args));
    mask_sensitive_command(&line)
}
