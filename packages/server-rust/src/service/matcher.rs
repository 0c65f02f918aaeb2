//! Glob allow-lists for invocation targets and service names.
//!
//! Patterns use `*` as a wildcard. A pattern prefixed with `!` denies; deny
//! patterns win over allow patterns.

use regex::Regex;

#[derive(Debug, Clone)]
pub struct Matcher {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl Matcher {
    /// Compiles the patterns.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern does not compile, which can only happen
    /// for extremely long patterns.
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allow = Vec::new();
        let mut deny = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            match pattern.strip_prefix('!') {
                Some(rest) => deny.push(compile(rest)?),
                None => allow.push(compile(pattern)?),
            }
        }
        Ok(Self { allow, deny })
    }

    #[must_use]
    pub fn is_allowed(&self, value: &str) -> bool {
        if self.deny.iter().any(|re| re.is_match(value)) {
            return false;
        }
        self.allow.iter().any(|re| re.is_match(value))
    }
}

fn compile(glob: &str) -> Result<Regex, regex::Error> {
    let body = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$"))
}
