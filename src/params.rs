//! Scenario parameters and command templates
//!
//! Parameters are a flat string mapping, as a test harness hands them to a
//! scenario. Values may reference other parameters with `${key}`; command
//! templates additionally carry positional `%s`/`%d` slots that the scenario
//! fills at run time. Both kinds of substitution are checked up front so a
//! scenario never starts with a template it cannot resolve.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::common::{Error, Result};

static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z0-9_.-]+)\}").expect("static regex"));

/// Maximum nesting of `${key}` references
const MAX_EXPANSION_DEPTH: usize = 8;

/// Named scenario parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    values: BTreeMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or overwrite) a parameter
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    /// Whether a parameter is present
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Raw value without reference expansion
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value with `${key}` references expanded; `None` when absent
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        match self.raw(key) {
            Some(v) => self.expand(key, v).map(Some),
            None => Ok(None),
        }
    }

    /// Value that must be present
    pub fn require(&self, key: &str) -> Result<String> {
        self.get(key)?
            .ok_or_else(|| Error::MissingParam(key.to_string()))
    }

    /// Value with a fallback when absent
    pub fn get_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.get(key)?.unwrap_or_else(|| default.to_string()))
    }

    /// Parse a required value
    pub fn parse<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let value = self.require(key)?;
        parse_value(key, &value)
    }

    /// Parse a value, falling back when absent
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key)? {
            Some(value) => parse_value(key, &value),
            None => Ok(default),
        }
    }

    /// Whitespace-separated list; empty when absent
    pub fn objects(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .get(key)?
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default())
    }

    /// Required command template
    pub fn template(&self, key: &str) -> Result<Template> {
        Ok(Template::new(key, self.require(key)?))
    }

    /// Optional command template; an empty value counts as absent
    pub fn optional_template(&self, key: &str) -> Result<Option<Template>> {
        Ok(self
            .get(key)?
            .filter(|v| !v.trim().is_empty())
            .map(|v| Template::new(key, v)))
    }

    /// Expand `${key}` references in arbitrary text
    ///
    /// `origin` names the parameter or setting the text came from, for errors.
    pub fn expand(&self, origin: &str, text: &str) -> Result<String> {
        let mut current = text.to_string();
        for _ in 0..MAX_EXPANSION_DEPTH {
            if !REFERENCE.is_match(&current) {
                return Ok(current);
            }
            let mut missing = None;
            let next = REFERENCE.replace_all(&current, |caps: &regex::Captures| {
                match self.values.get(&caps[1]) {
                    Some(v) => v.clone(),
                    None => {
                        missing.get_or_insert_with(|| caps[1].to_string());
                        String::new()
                    }
                }
            });
            if let Some(reference) = missing {
                return Err(Error::UnresolvedReference {
                    key: origin.to_string(),
                    reference,
                });
            }
            current = next.into_owned();
        }
        Err(Error::Config(format!(
            "parameter '{}' nests references deeper than {} levels",
            origin, MAX_EXPANSION_DEPTH
        )))
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| Error::invalid_param(key, value, e))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Slot,
}

/// A command with positional `%s`/`%d` slots
///
/// `%%` is a literal percent sign; any other `%x` is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    key: String,
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn new(key: impl Into<String>, source: impl Into<String>) -> Self {
        let source = source.into();
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                text.push(c);
                continue;
            }
            match chars.peek() {
                Some('s') | Some('d') => {
                    chars.next();
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Slot);
                }
                Some('%') => {
                    chars.next();
                    text.push('%');
                }
                _ => text.push('%'),
            }
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Self {
            key: key.into(),
            source,
            segments,
        }
    }

    /// Parameter name the template came from
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Template text as configured
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Number of positional slots
    pub fn arity(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Slot))
            .count()
    }

    /// Require exactly `n` slots
    pub fn expect_arity(self, n: usize) -> Result<Self> {
        self.expect_arity_in(&[n])
    }

    /// Require one of the given slot counts
    pub fn expect_arity_in(self, allowed: &[usize]) -> Result<Self> {
        let arity = self.arity();
        if allowed.contains(&arity) {
            Ok(self)
        } else {
            Err(Error::TemplateArity {
                key: self.key,
                expected: allowed.first().copied().unwrap_or(0),
                got: arity,
            })
        }
    }

    /// Fill the slots in order
    pub fn render(&self, args: &[&str]) -> Result<String> {
        let arity = self.arity();
        if args.len() != arity {
            return Err(Error::TemplateArity {
                key: self.key.clone(),
                expected: arity,
                got: args.len(),
            });
        }

        let mut out = String::with_capacity(self.source.len());
        let mut args = args.iter();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Slot => {
                    if let Some(arg) = args.next() {
                        out.push_str(arg);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Render with a single value in every slot (zero slots renders as-is)
    pub fn render_repeated(&self, value: &str) -> String {
        let args = vec![value; self.arity()];
        // Arity matches by construction.
        self.render(&args).unwrap_or_else(|_| self.source.clone())
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_require_and_defaults() {
        let p = params(&[("repeat_times", "3"), ("main_vm", "vm1")]);
        assert_eq!(p.require("main_vm").unwrap(), "vm1");
        assert_eq!(p.parse::<u32>("repeat_times").unwrap(), 3);
        assert_eq!(p.parse_or::<u64>("disk_op_timeout", 360).unwrap(), 360);
        assert!(matches!(
            p.require("nbd_port_data1"),
            Err(Error::MissingParam(k)) if k == "nbd_port_data1"
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let p = params(&[("repeat_times", "two")]);
        let err = p.parse::<u32>("repeat_times").unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("repeat_times"));
    }

    #[test]
    fn test_objects_split_on_whitespace() {
        let p = params(&[("vms", "vm1  vm2\tvm3")]);
        assert_eq!(p.objects("vms").unwrap(), vec!["vm1", "vm2", "vm3"]);
        assert!(p.objects("images").unwrap().is_empty());
    }

    #[test]
    fn test_reference_expansion() {
        let p = params(&[
            ("port", "10809"),
            ("rule", "-p tcp --dport ${port} -j REJECT"),
            ("net_break_cmd", "iptables -I INPUT ${rule}"),
        ]);
        assert_eq!(
            p.require("net_break_cmd").unwrap(),
            "iptables -I INPUT -p tcp --dport 10809 -j REJECT"
        );
    }

    #[test]
    fn test_unknown_reference_is_config_error() {
        let p = params(&[("sev_enable_check", "dmesg | grep -i ${sev_keyword}")]);
        let err = p.require("sev_enable_check").unwrap_err();
        assert!(matches!(
            err,
            Error::UnresolvedReference { ref reference, .. } if reference == "sev_keyword"
        ));
    }

    #[test]
    fn test_reference_cycle_is_bounded() {
        let p = params(&[("a", "${b}"), ("b", "${a}")]);
        assert!(p.require("a").unwrap_err().is_config());
    }

    #[test]
    fn test_template_arity_and_render() {
        let t = Template::new("disk_op_cmd", "dd if=/dev/zero of=%s bs=1M count=10 && dd if=%s of=/dev/null");
        assert_eq!(t.arity(), 2);
        assert_eq!(
            t.render(&["/dev/sdb", "/dev/sdb"]).unwrap(),
            "dd if=/dev/zero of=/dev/sdb bs=1M count=10 && dd if=/dev/sdb of=/dev/null"
        );
        assert_eq!(t.render_repeated("/dev/vda"), "dd if=/dev/zero of=/dev/vda bs=1M count=10 && dd if=/dev/vda of=/dev/null");
        assert!(matches!(
            t.render(&["/dev/sdb"]),
            Err(Error::TemplateArity { expected: 2, got: 1, .. })
        ));
    }

    #[test]
    fn test_template_percent_escapes() {
        let t = Template::new("x", "date +%H:%M; echo 100%% %d");
        assert_eq!(t.arity(), 1);
        assert_eq!(t.render(&["7"]).unwrap(), "date +%H:%M; echo 100% 7");
    }

    #[test]
    fn test_expect_arity() {
        let t = Template::new("find_data_disk_pid_cmd", "fuser -k %s/tcp");
        assert!(t.clone().expect_arity(1).is_ok());
        assert!(matches!(
            t.clone().expect_arity(0),
            Err(Error::TemplateArity { expected: 0, got: 1, .. })
        ));
        assert!(t.expect_arity_in(&[0, 1]).is_ok());
    }

    #[test]
    fn test_optional_template_treats_blank_as_absent() {
        let p = params(&[("disk_op_cmd", "  ")]);
        assert!(p.optional_template("disk_op_cmd").unwrap().is_none());
        assert!(p.optional_template("missing").unwrap().is_none());
    }
}
