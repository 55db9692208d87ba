//! `<tag>` substitution for action command templates.

use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use crate::error::{WardenError, WardenResult};
use crate::ticket::EventInfo;

/// Characters backslash-escaped in untrusted tag values.
const SHELL_SPECIAL: &str = "\\#&;`|*?~<>^()[]{}$\n'\"";

fn tag_pattern() -> Option<&'static Regex> {
    static TAG: OnceLock<Option<Regex>> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"<([^ >]+)>").ok()).as_ref()
}

/// Names of all `<tag>` tokens in `text`, in order of appearance.
pub fn tags_in(text: &str) -> Vec<String> {
    match tag_pattern() {
        Some(re) => re.captures_iter(text).map(|c| c[1].to_string()).collect(),
        None => Vec::new(),
    }
}

fn replace_tags(text: &str, mut lookup: impl FnMut(&str) -> Option<String>) -> String {
    match tag_pattern() {
        Some(re) => re
            .replace_all(text, |caps: &Captures| {
                lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned(),
        None => text.to_string(),
    }
}

fn expand(
    key: &str,
    raw: &BTreeMap<String, String>,
    done: &mut BTreeMap<String, String>,
    visiting: &mut HashSet<String>,
) -> WardenResult<String> {
    if let Some(value) = done.get(key) {
        return Ok(value.clone());
    }
    let Some(value) = raw.get(key) else {
        return Ok(format!("<{}>", key));
    };
    if !visiting.insert(key.to_string()) {
        return Err(WardenError::Config(format!(
            "recursive definition of tag <{}>",
            key
        )));
    }
    let mut failure = None;
    let expanded = replace_tags(value, |name| {
        if failure.is_some() || !raw.contains_key(name) {
            return None;
        }
        match expand(name, raw, done, visiting) {
            Ok(v) => Some(v),
            Err(e) => {
                failure = Some(e);
                None
            }
        }
    });
    visiting.remove(key);
    if let Some(e) = failure {
        return Err(e);
    }
    done.insert(key.to_string(), expanded.clone());
    Ok(expanded)
}

/// Expand tags that refer to other keys of the same map until nothing
/// changes. Tags naming unknown keys are left in place.
pub fn resolve_tags(tags: &BTreeMap<String, String>) -> WardenResult<BTreeMap<String, String>> {
    let mut done = BTreeMap::new();
    let mut visiting = HashSet::new();
    for key in tags.keys() {
        expand(key, tags, &mut done, &mut visiting)?;
    }
    Ok(done)
}

/// Backslash-escape shell metacharacters.
pub fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if SHELL_SPECIAL.contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Substitute a command template.
///
/// Static tags from `cinfo` are expanded first (after resolving references
/// between them), then event tags. Values coming from an event are inserted
/// verbatim and never expanded again; `matches` is shell-escaped because its
/// content comes straight from the log. Unknown tags stay untouched, and
/// `<br>` becomes a newline at the very end.
pub fn substitute(
    template: &str,
    cinfo: &BTreeMap<String, String>,
    event: Option<&EventInfo>,
) -> WardenResult<String> {
    let resolved = resolve_tags(cinfo)?;
    let text = replace_tags(template, |name| resolved.get(name).cloned());
    let text = match event {
        Some(info) => replace_tags(&text, |name| {
            info.get(name).map(|value| {
                if name == "matches" {
                    escape_tag(&value)
                } else {
                    value
                }
            })
        }),
        None => text,
    };
    Ok(text.replace("<br>", "\n"))
}
