//! A parsed client command.

use bytes::Bytes;

/// One decoded command: the name and its arguments, in wire order.
///
/// Argument zero is the command name. Arguments are kept as raw [`Bytes`]
/// because keys and values are binary-safe; helpers convert to text or
/// integers where a handler needs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Builds a command from already-split arguments.
    pub fn from_args(args: Vec<Bytes>) -> Self {
        Self { args }
    }

    /// All arguments including the command name.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Number of arguments including the command name.
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// The command name uppercased for table lookup.
    ///
    /// Non-ASCII bytes pass through untouched; they simply won't match any
    /// registered name and fall into the unknown-command path.
    pub fn name_upper(&self) -> String {
        self.args
            .first()
            .map(|name| {
                name.iter()
                    .map(|b| b.to_ascii_uppercase() as char)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Argument at `index`, if present.
    pub fn arg(&self, index: usize) -> Option<&Bytes> {
        self.args.get(index)
    }

    /// Argument at `index` as UTF-8 text.
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args
            .get(index)
            .and_then(|arg| std::str::from_utf8(arg).ok())
    }

    /// Argument at `index` parsed as a signed 64-bit integer.
    pub fn arg_i64(&self, index: usize) -> Option<i64> {
        self.arg_str(index).and_then(|s| s.parse().ok())
    }

    /// True when the argument at `index` equals `keyword` ASCII
    /// case-insensitively. Used for option parsing (`EX`, `CAS`).
    pub fn arg_eq_ignore_case(&self, index: usize, keyword: &str) -> bool {
        self.args
            .get(index)
            .is_some_and(|arg| arg.eq_ignore_ascii_case(keyword.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Command {
        Command::from_args(parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect())
    }

    #[test]
    fn name_is_uppercased() {
        assert_eq!(cmd(&["set", "k", "v"]).name_upper(), "SET");
        assert_eq!(cmd(&["PsYnC", "?", "0"]).name_upper(), "PSYNC");
    }

    #[test]
    fn empty_command_has_empty_name() {
        assert_eq!(cmd(&[]).name_upper(), "");
        assert_eq!(cmd(&[]).arity(), 0);
    }

    #[test]
    fn integer_arguments() {
        let c = cmd(&["EXPIRE", "k", "30"]);
        assert_eq!(c.arg_i64(2), Some(30));
        assert_eq!(c.arg_i64(1), None);
    }

    #[test]
    fn option_keyword_matching() {
        let c = cmd(&["SET", "k", "v", "ex", "10"]);
        assert!(c.arg_eq_ignore_case(3, "EX"));
        assert!(!c.arg_eq_ignore_case(3, "CAS"));
    }
}
