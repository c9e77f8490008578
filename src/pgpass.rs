//! Credentials file lookup.
//!
//! Consulted as a last resort when no password and no producer is
//! configured; any failure here is non-fatal unless authentication itself
//! then fails.
use std::path::{Path, PathBuf};

/// Resolve the passfile location: explicit config, then `PGPASSFILE`, then
/// `~/.pgpass`.
pub fn default_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("PGPASSFILE") {
        return Some(PathBuf::from(path));
    }
    std::env::var_os("HOME").map(|home| Path::new(&home).join(".pgpass"))
}

/// Find a password for the connection target.
///
/// Each line is `hostname:port:database:username:password`; any of the first
/// four fields may be `*`. `#` starts a comment, `\` escapes `:` and `\`
/// within a field.
pub fn lookup(path: &Path, host: &str, port: u16, dbname: &str, user: &str) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let port = port.to_string();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = split_fields(line);
        let (Some(f_host), Some(f_port), Some(f_db), Some(f_user), Some(f_pass)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            continue;
        };

        if matches(&f_host, host)
            && matches(&f_port, &port)
            && matches(&f_db, dbname)
            && matches(&f_user, user)
        {
            return Some(f_pass);
        }
    }

    None
}

fn matches(field: &str, value: &str) -> bool {
    field == "*" || field == value
}

/// Split on unescaped `:`, resolving `\:` and `\\`.
fn split_fields(line: &str) -> impl Iterator<Item = String> + '_ {
    let mut chars = line.chars().peekable();
    std::iter::from_fn(move || {
        chars.peek()?;
        let mut field = String::new();
        while let Some(c) = chars.next() {
            match c {
                ':' => return Some(field),
                '\\' => field.push(chars.next()?),
                c => field.push(c),
            }
        }
        Some(field)
    })
}
