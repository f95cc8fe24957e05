//! Ordered path rules deciding whether a request is public, forbidden, or
//! needs a session.

use crate::error::{Result, ValidationErrors};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
    #[default]
    Auth,
}

/// A rule as written in configuration. Exactly one matcher field should be
/// set; none at all matches every path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    pub exact: Option<String>,
    pub prefix: Option<String>,
    pub regex: Option<String>,
    pub glob: Option<String>,
    pub action: Action,
}

#[derive(Debug, Clone)]
pub enum Matcher {
    Exact(String),
    Prefix(String),
    Regex(Regex),
    Glob(Regex),
    CatchAll,
}

impl Matcher {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Matcher::Exact(p) => path == p,
            Matcher::Prefix(p) => path.starts_with(p.as_str()),
            Matcher::Regex(re) | Matcher::Glob(re) => re.is_match(path),
            Matcher::CatchAll => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub matcher: Matcher,
    pub action: Action,
}

impl Rule {
    pub fn new(matcher: Matcher, action: Action) -> Self {
        Self { matcher, action }
    }
}

/// Translate a glob into an anchored regular expression.
///
/// `*` matches within one path segment, `**` across segments, `?` one
/// character other than `/`, and `{a,b}` either alternative. Braces nest.
pub fn glob_to_regex(glob: &str) -> std::result::Result<Regex, String> {
    let mut pattern = String::from("^");
    let mut chars = glob.chars().peekable();
    let mut depth = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                pattern.push_str(".*");
            }
            '*' => pattern.push_str("[^/]*"),
            '?' => pattern.push_str("[^/]"),
            '{' => {
                depth += 1;
                pattern.push_str("(?:");
            }
            '}' if depth > 0 => {
                depth -= 1;
                pattern.push(')');
            }
            ',' if depth > 0 => pattern.push('|'),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    if depth > 0 {
        return Err(format!("unclosed '{{' in glob {:?}", glob));
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|e| e.to_string())
}

impl RuleConfig {
    pub fn compile(&self) -> std::result::Result<Rule, String> {
        let set: Vec<&str> = [
            ("exact", &self.exact),
            ("prefix", &self.prefix),
            ("regex", &self.regex),
            ("glob", &self.glob),
        ]
        .iter()
        .filter(|(_, v)| v.is_some())
        .map(|(name, _)| *name)
        .collect();
        if set.len() > 1 {
            return Err(format!("rule sets more than one matcher: {}", set.join(", ")));
        }

        let matcher = if let Some(exact) = &self.exact {
            Matcher::Exact(exact.clone())
        } else if let Some(prefix) = &self.prefix {
            Matcher::Prefix(prefix.clone())
        } else if let Some(re) = &self.regex {
            Matcher::Regex(Regex::new(re).map_err(|e| format!("invalid regex {:?}: {}", re, e))?)
        } else if let Some(glob) = &self.glob {
            Matcher::Glob(glob_to_regex(glob)?)
        } else {
            Matcher::CatchAll
        };
        Ok(Rule::new(matcher, self.action))
    }
}

/// Rules evaluated in order; the first match decides.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Compile every rule, reporting all failures together.
    pub fn compile(configs: &[RuleConfig]) -> Result<Self> {
        let mut errors = ValidationErrors::new();
        let mut rules = Vec::with_capacity(configs.len());
        for (i, config) in configs.iter().enumerate() {
            match config.compile() {
                Ok(rule) => rules.push(rule),
                Err(e) => errors.push(format!("rules[{}]: {}", i, e)),
            }
        }
        errors.into_result()?;
        Ok(Self { rules })
    }

    /// Action for `path`; `Auth` when no rule matches.
    pub fn evaluate(&self, path: &str) -> Action {
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(path))
            .map(|rule| rule.action)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
