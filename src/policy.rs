//! Proxy-call authorization policy.
//!
//! The policy is a stateless predicate over the tuple
//! `(caller, target, bus name, object path, interface, method)`. Rules are
//! evaluated in configuration order; the first matching rule decides, and a
//! call that matches no rule is denied.
//!
//! Rule fields are shell-style globs. `*` matches any run of characters,
//! `?` matches exactly one, and an empty pattern matches anything. Globs
//! are compiled to anchored regexes once, at policy construction.

use crate::config::{ProxyCallRule, RuleEffect};
use crate::error::{Error, Result};
use regex::Regex;

/// A single compiled rule.
struct CompiledRule {
    caller: Matcher,
    target: Matcher,
    bus_name: Matcher,
    object_path: Matcher,
    interface: Matcher,
    method: Matcher,
    effect: RuleEffect,
}

/// Compiled form of one glob pattern.
enum Matcher {
    /// Empty pattern: matches anything.
    Any,
    /// No glob metacharacters: plain string equality.
    Literal(String),
    /// Anchored regex compiled from the glob.
    Glob(Regex),
}

impl Matcher {
    fn compile(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Ok(Matcher::Any);
        }
        if !pattern.contains(['*', '?']) {
            return Ok(Matcher::Literal(pattern.to_string()));
        }

        let mut regex = String::with_capacity(pattern.len() + 8);
        regex.push('^');
        for c in pattern.chars() {
            match c {
                '*' => regex.push_str(".*"),
                '?' => regex.push('.'),
                c => regex.push_str(&regex::escape(&c.to_string())),
            }
        }
        regex.push('$');

        let compiled = Regex::new(&regex).map_err(|e| Error::Internal(format!(
            "glob '{pattern}' compiled to invalid regex: {e}"
        )))?;
        Ok(Matcher::Glob(compiled))
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Any => true,
            Matcher::Literal(s) => s == value,
            Matcher::Glob(re) => re.is_match(value),
        }
    }
}

/// Ordered first-match-wins proxy-call policy.
pub struct ProxyCallPolicy {
    rules: Vec<CompiledRule>,
}

impl ProxyCallPolicy {
    /// Compiles the configured rule list.
    ///
    /// # Errors
    ///
    /// Returns an error if any glob fails to compile; this is fatal at
    /// daemon startup.
    pub fn new(rules: &[ProxyCallRule]) -> Result<Self> {
        let compiled = rules
            .iter()
            .map(|r| {
                Ok(CompiledRule {
                    caller: Matcher::compile(&r.caller)?,
                    target: Matcher::compile(&r.target)?,
                    bus_name: Matcher::compile(&r.target_bus_name)?,
                    object_path: Matcher::compile(&r.target_object_path)?,
                    interface: Matcher::compile(&r.target_interface)?,
                    method: Matcher::compile(&r.target_method)?,
                    effect: r.effect,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules: compiled })
    }

    /// Decides whether the call is permitted. First matching rule wins;
    /// no match denies.
    #[must_use]
    pub fn is_allowed(
        &self,
        caller: &str,
        target: &str,
        bus_name: &str,
        object_path: &str,
        interface: &str,
        method: &str,
    ) -> bool {
        for rule in &self.rules {
            if rule.caller.matches(caller)
                && rule.target.matches(target)
                && rule.bus_name.matches(bus_name)
                && rule.object_path.matches(object_path)
                && rule.interface.matches(interface)
                && rule.method.matches(method)
            {
                return rule.effect == RuleEffect::Allow;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(caller: &str, target: &str, effect: RuleEffect) -> ProxyCallRule {
        ProxyCallRule {
            caller: caller.to_string(),
            target: target.to_string(),
            effect,
            ..ProxyCallRule::default()
        }
    }

    #[test]
    fn test_default_deny() {
        let policy = ProxyCallPolicy::new(&[]).unwrap();
        assert!(!policy.is_allowed("z1", "host", "org.foo", "/", "org.foo", "Ping"));
    }

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            rule("z1", "host", RuleEffect::Allow),
            rule("*", "*", RuleEffect::Deny),
        ];
        let policy = ProxyCallPolicy::new(&rules).unwrap();
        assert!(policy.is_allowed("z1", "host", "org.foo", "/", "org.foo", "Ping"));
        assert!(!policy.is_allowed("z2", "host", "org.foo", "/", "org.foo", "Ping"));
    }

    #[test]
    fn test_deny_shadows_later_allow() {
        let rules = vec![
            rule("z1", "host", RuleEffect::Deny),
            rule("z1", "*", RuleEffect::Allow),
        ];
        let policy = ProxyCallPolicy::new(&rules).unwrap();
        assert!(!policy.is_allowed("z1", "host", "b", "p", "i", "m"));
        assert!(policy.is_allowed("z1", "z2", "b", "p", "i", "m"));
    }

    #[test]
    fn test_empty_pattern_matches_anything() {
        let rules = vec![ProxyCallRule::default()];
        let policy = ProxyCallPolicy::new(&rules).unwrap();
        assert!(policy.is_allowed("anything", "at", "all", "/x/y", "i.f", "M"));
    }

    #[test]
    fn test_glob_metacharacters() {
        let mut r = rule("z?", "*", RuleEffect::Allow);
        r.target_interface = "org.tizen.*".to_string();
        let policy = ProxyCallPolicy::new(&[r]).unwrap();
        assert!(policy.is_allowed("z1", "host", "b", "p", "org.tizen.power", "m"));
        assert!(!policy.is_allowed("z12", "host", "b", "p", "org.tizen.power", "m"));
        assert!(!policy.is_allowed("z1", "host", "b", "p", "com.example", "m"));
    }

    #[test]
    fn test_regex_metacharacters_are_escaped() {
        let mut r = rule("*", "*", RuleEffect::Allow);
        r.target_object_path = "/a.b/*".to_string();
        let policy = ProxyCallPolicy::new(&[r]).unwrap();
        // '.' in the pattern must not act as a wildcard.
        assert!(policy.is_allowed("z1", "host", "b", "/a.b/c", "i", "m"));
        assert!(!policy.is_allowed("z1", "host", "b", "/axb/c", "i", "m"));
    }
}
