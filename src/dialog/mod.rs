//! Terminal credential prompts
//!
//! Used by the CLI before a session starts. Passwords are read without
//! echo through `rpassword`.

use std::io::{self, BufRead, Write};

/// Prompt for a username on stdin. `None` on empty input or EOF.
pub fn prompt_username(profile: &str) -> io::Result<Option<String>> {
    let stdin = io::stdin();
    read_username(&mut stdin.lock(), &mut io::stderr(), profile)
}

/// Prompt for a password without echo. `None` on empty input.
pub fn prompt_password(kind: &str, profile: &str) -> io::Result<Option<String>> {
    let password = rpassword::prompt_password(format!("{} password for {}: ", kind, profile))?;
    Ok(non_empty(password))
}

fn read_username<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    profile: &str,
) -> io::Result<Option<String>> {
    write!(output, "Username for {}: ", profile)?;
    output.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(non_empty(line.trim().to_string()))
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}
