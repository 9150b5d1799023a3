/// Quote one argument for inclusion in a shell line on the current platform
pub fn escape_argument(argument: &str) -> String {
    if cfg!(windows) {
        escape_argument_windows(argument)
    } else {
        escape_argument_posix(argument)
    }
}

/// Single-quote for `/bin/sh`, closing and reopening around embedded quotes
pub fn escape_argument_posix(argument: &str) -> String {
    format!("'{}'", argument.replace('\'', r"'\''"))
}

/// Quote for `cmd.exe`
///
/// Double quotes become `\"`, a `%VAR%` segment is wrapped in `^%` so it is
/// not expanded, and a trailing backslash is doubled before the closing quote.
pub fn escape_argument_windows(argument: &str) -> String {
    if argument.is_empty() {
        return "\"\"".to_string();
    }

    let mut escaped = String::with_capacity(argument.len() + 2);
    let mut quote = false;

    for part in split_keeping_quotes(argument) {
        if part == "\"" {
            escaped.push_str("\\\"");
        } else if is_surrounded_by(part, '%') {
            escaped.push_str("^%\"");
            escaped.push_str(&part[1..part.len() - 1]);
            escaped.push_str("\"^%");
        } else {
            quote = true;
            escaped.push_str(part);
            if part.ends_with('\\') {
                escaped.push('\\');
            }
        }
    }

    if quote {
        format!("\"{escaped}\"")
    } else {
        escaped
    }
}

/// Split on `"` keeping each quote as its own segment, without empty segments
fn split_keeping_quotes(argument: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (index, ch) in argument.char_indices() {
        if ch == '"' {
            if start < index {
                parts.push(&argument[start..index]);
            }
            parts.push(&argument[index..index + 1]);
            start = index + 1;
        }
    }
    if start < argument.len() {
        parts.push(&argument[start..]);
    }
    parts
}

fn is_surrounded_by(part: &str, ch: char) -> bool {
    part.len() > 1 && part.starts_with(ch) && part.ends_with(ch)
}
