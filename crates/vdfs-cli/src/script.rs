//! Command-line tokenizer for `name -key=value -flag` scripts.

use anyhow::{Context, Result, anyhow, bail};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Lowercased command name.
    pub name: String,
    /// Lowercased keys. Bare flags map to an empty value.
    pub args: BTreeMap<String, String>,
}

impl Command {
    /// Parse one script line. Blank lines and `#` comments yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let mut tokens = tokenize(line)?.into_iter();
        let Some(name) = tokens.next() else {
            return Ok(None);
        };
        let mut args = BTreeMap::new();
        for token in tokens {
            let Some(body) = token.strip_prefix('-') else {
                bail!("unexpected argument {token:?} (expected -key=value)");
            };
            let (key, value) = body.split_once('=').unwrap_or((body, ""));
            if key.is_empty() {
                bail!("empty parameter name in {token:?}");
            }
            if args.insert(key.to_ascii_lowercase(), value.to_owned()).is_some() {
                bail!("parameter -{key} given twice");
            }
        }
        Ok(Some(Self {
            name: name.to_ascii_lowercase(),
            args,
        }))
    }

    pub fn required(&self, key: &str) -> Result<&str> {
        self.args
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("{} requires -{key}", self.name))
    }

    #[must_use]
    pub fn optional(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.args.contains_key(key)
    }

    pub fn number(&self, key: &str) -> Result<Option<i64>> {
        self.optional(key)
            .map(|text| {
                text.parse::<i64>()
                    .with_context(|| format!("-{key} must be an integer, got {text:?}"))
            })
            .transpose()
    }

    /// Values of `-file1`, `-file2`, … in numeric order.
    #[must_use]
    pub fn numbered(&self, prefix: &str) -> Vec<&str> {
        let mut found: Vec<(u32, &str)> = self
            .args
            .iter()
            .filter_map(|(key, value)| {
                let n = key.strip_prefix(prefix)?.parse().ok()?;
                Some((n, value.as_str()))
            })
            .collect();
        found.sort_by_key(|(n, _)| *n);
        found.into_iter().map(|(_, value)| value).collect()
    }
}

/// Split on whitespace outside double quotes. Quotes are removed.
fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut started = false;
    for ch in line.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                started = true;
            }
            c if c.is_whitespace() && !quoted => {
                if started {
                    tokens.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }
    if quoted {
        bail!("unterminated quote");
    }
    if started {
        tokens.push(current);
    }
    Ok(tokens)
}
