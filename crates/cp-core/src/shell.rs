//! Remote shell command construction
//!
//! Arguments to the local `ssh` executable are always passed as a vector.
//! The one string that crosses to the remote side is a `sh -lc <payload>`
//! command whose payload is built here, with every interpolated value run
//! through [`quote`].

/// Single-quote a value for a POSIX shell (`'` becomes `'\''`)
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Wrap a script as the remote command `sh -lc '<script>'`
pub fn login_shell(script: &str) -> String {
    format!("sh -lc {}", quote(script))
}

/// A path under the remote `$HOME`, leaving `$HOME` to expand remotely
///
/// `home_path(".local/bin/x")` yields `"$HOME"/'.local/bin/x'`.
pub fn home_path(relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        "\"$HOME\"".to_string()
    } else {
        format!("\"$HOME\"/{}", quote(relative))
    }
}

/// Quote a user-supplied remote path, expanding a leading `~/` to `$HOME`
pub fn remote_path(path: &str) -> String {
    if path == "~" {
        home_path("")
    } else if let Some(rest) = path.strip_prefix("~/") {
        home_path(rest)
    } else {
        quote(path)
    }
}

/// True if `key` is a valid environment variable name
pub fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first == '_' || first.is_ascii_alphabetic()) {
        return false;
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Render `KEY=value` assignments for a command prefix
///
/// Values are already shell words (quoted literals or `home_path`
/// expressions). Invalid keys are skipped with a warning.
pub fn env_prefix(vars: &[(&str, String)]) -> String {
    let mut parts = Vec::with_capacity(vars.len());
    for (key, value) in vars {
        if !is_valid_env_key(key) {
            tracing::warn!(key = %key, "Skipping invalid environment variable name");
            continue;
        }
        parts.push(format!("{}={}", key, value));
    }
    parts.join(" ")
}
