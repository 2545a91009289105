//! Shell quoting for commands sent through `vagrant ssh -c`.

/// Characters the guest shell would interpret.
const SHELL_SPECIAL: &str = " \t\n\r\"'\\$`!*?[]{}()<>|&;#~";

/// Quote a string for use in a shell command.
/// Wraps the string in single quotes and escapes any existing single quotes.
pub fn quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }

    if !needs_quoting(s) {
        return s.to_string();
    }

    // abc's -> 'abc'"'"'s'
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// Quote a path pattern while leaving glob characters live for the remote shell.
pub fn quote_glob(pattern: &str) -> String {
    let mut out = String::new();
    let mut literal = String::new();
    for ch in pattern.chars() {
        if matches!(ch, '*' | '?' | '[' | ']') {
            if !literal.is_empty() {
                out.push_str(&quote(&literal));
                literal.clear();
            }
            out.push(ch);
        } else {
            literal.push(ch);
        }
    }
    if !literal.is_empty() {
        out.push_str(&quote(&literal));
    }
    out
}

fn needs_quoting(s: &str) -> bool {
    s.chars().any(|c| SHELL_SPECIAL.contains(c))
}

/// Join arguments with proper quoting for shell execution.
pub fn join_args<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|s| quote(s.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a shell command string into arguments.
pub fn split_args(s: &str) -> Result<Vec<String>, shell_words::ParseError> {
    shell_words::split(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("simple"), "simple");
        assert_eq!(quote("with space"), "'with space'");
        assert_eq!(quote("it's"), "'it'\"'\"'s'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("$var"), "'$var'");
    }

    #[test]
    fn test_quote_glob() {
        assert_eq!(quote_glob("/var/log/*.log"), "/var/log/*.log");
        assert_eq!(quote_glob("/my dir/*.log"), "'/my dir/'*.log");
    }

    #[test]
    fn test_join_args() {
        let args = vec!["git", "clone", "https://x/y z.git"];
        assert_eq!(join_args(args), "git clone 'https://x/y z.git'");
    }

    #[test]
    fn test_split_args() {
        let args = split_args("fetch 'evil.example' 443").unwrap();
        assert_eq!(args, vec!["fetch", "evil.example", "443"]);
    }
}
