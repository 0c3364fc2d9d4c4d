use std::fmt::Display;

/// Helper to format a string for inclusion in a POSIX shell script.
#[derive(Debug)]
pub struct ShellQuoted<'a> {
    s: &'a str,
}

impl<'a> Display for ShellQuoted<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.s.is_empty()
            && self
                .s
                .chars()
                .all(|c| {
                    matches!(c, '/' | '.' | '-' | '_' | ':' | '=') || c.is_ascii_alphanumeric()
                })
        {
            return f.write_str(self.s);
        }
        match shlex::try_quote(self.s) {
            Ok(r) => f.write_str(&r),
            // Only fails on interior NUL, which no shell could represent anyway
            Err(_) => Err(std::fmt::Error),
        }
    }
}

impl<'a> ShellQuoted<'a> {
    /// Given a string, quote it in a way that it would be parsed by a default
    /// POSIX shell as a single word. If the value has no spaces or shell
    /// meta-characters, it will be exactly the same as the input.
    pub fn new(s: &'a str) -> ShellQuoted<'a> {
        ShellQuoted { s }
    }
}
