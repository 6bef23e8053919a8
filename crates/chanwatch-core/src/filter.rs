//! Priority-ordered message rules.
//!
//! Rules are validated when they are created ([`RuleDraft::validate`]) and
//! compiled once per run ([`FilterEngine::load`]). Evaluation never fails.

use std::{collections::HashSet, fmt, str::FromStr};

use regex::Regex;

use crate::{
    domain::{ChannelId, UserId},
    errors::Error,
    store::Store,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Keyword,
    Regex,
    UserId,
    ChannelId,
    MinLength,
}

impl RuleKind {
    /// Name stored in the `filters.kind` column.
    pub fn as_str(self) -> &'static str {
        match self {
            RuleKind::Keyword => "keyword",
            RuleKind::Regex => "regex",
            RuleKind::UserId => "user",
            RuleKind::ChannelId => "channel",
            RuleKind::MinLength => "length",
        }
    }
}

impl FromStr for RuleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyword" => Ok(RuleKind::Keyword),
            "regex" => Ok(RuleKind::Regex),
            "user" | "userid" | "user_id" => Ok(RuleKind::UserId),
            "channel" | "channelid" | "channel_id" => Ok(RuleKind::ChannelId),
            "length" | "minlength" | "min_length" => Ok(RuleKind::MinLength),
            other => Err(Error::InvalidRule(format!("unknown rule kind: {other:?}"))),
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleAction {
    Forward,
    Ignore,
    Highlight,
}

impl RuleAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleAction::Forward => "forward",
            RuleAction::Ignore => "ignore",
            RuleAction::Highlight => "highlight",
        }
    }
}

impl FromStr for RuleAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(RuleAction::Forward),
            "ignore" => Ok(RuleAction::Ignore),
            "highlight" => Ok(RuleAction::Highlight),
            other => Err(Error::InvalidRule(format!("unknown rule action: {other:?}"))),
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of evaluating the active rules against one message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Forward,
    Ignored,
    Highlight,
}

impl Verdict {
    /// Name stored in the `messages.verdict` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Forward => "forward",
            Verdict::Ignored => "ignored",
            Verdict::Highlight => "highlight",
        }
    }

    pub fn is_forwarded(self) -> bool {
        !matches!(self, Verdict::Ignored)
    }
}

impl FromStr for Verdict {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "forward" => Ok(Verdict::Forward),
            "ignored" => Ok(Verdict::Ignored),
            "highlight" => Ok(Verdict::Highlight),
            other => Err(Error::Persistence(format!("unknown verdict: {other:?}"))),
        }
    }
}

/// A stored rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterRule {
    pub id: i64,
    pub name: String,
    pub kind: RuleKind,
    pub pattern: String,
    pub action: RuleAction,
    pub priority: i32,
    pub enabled: bool,
}

/// Unvalidated rule input, as typed by a user.
#[derive(Clone, Debug, Default)]
pub struct RuleDraft {
    pub name: String,
    pub kind: String,
    pub pattern: String,
    pub action: String,
    pub priority: i32,
}

impl RuleDraft {
    pub fn validate(self) -> Result<ValidRule> {
        let kind: RuleKind = self.kind.parse()?;
        let action: RuleAction = self.action.parse()?;
        let pattern = self.pattern.trim().to_string();
        if pattern.is_empty() {
            return Err(Error::InvalidRule("pattern must not be empty".to_string()));
        }
        Predicate::compile(kind, &pattern)?;

        let name = match self.name.trim() {
            "" => pattern.clone(),
            n => n.to_string(),
        };

        Ok(ValidRule {
            name,
            kind,
            pattern,
            action,
            priority: self.priority,
        })
    }
}

/// A rule that passed validation. Only [`RuleDraft::validate`] builds one, so
/// stores never persist a pattern that would fail to compile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidRule {
    name: String,
    kind: RuleKind,
    pattern: String,
    action: RuleAction,
    priority: i32,
}

impl ValidRule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn action(&self) -> RuleAction {
        self.action
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Materialize as an enabled stored rule under `id`.
    pub fn into_rule(self, id: i64) -> FilterRule {
        FilterRule {
            id,
            name: self.name,
            kind: self.kind,
            pattern: self.pattern,
            action: self.action,
            priority: self.priority,
            enabled: true,
        }
    }
}

#[derive(Debug)]
enum Predicate {
    Keywords(Vec<String>),
    Regex(Regex),
    Users(HashSet<i64>),
    Channels(HashSet<i64>),
    MinLength(usize),
}

impl Predicate {
    fn compile(kind: RuleKind, pattern: &str) -> Result<Self> {
        match kind {
            RuleKind::Keyword => {
                let terms: Vec<String> = split_terms(pattern).map(str::to_lowercase).collect();
                if terms.is_empty() {
                    return Err(Error::InvalidRule(
                        "keyword rule needs at least one term".to_string(),
                    ));
                }
                Ok(Predicate::Keywords(terms))
            }
            RuleKind::Regex => Regex::new(pattern)
                .map(Predicate::Regex)
                .map_err(|e| Error::InvalidRule(format!("bad regex {pattern:?}: {e}"))),
            RuleKind::UserId => parse_id_list(pattern).map(Predicate::Users),
            RuleKind::ChannelId => parse_id_list(pattern).map(Predicate::Channels),
            RuleKind::MinLength => pattern
                .trim()
                .parse::<usize>()
                .map(Predicate::MinLength)
                .map_err(|_| Error::InvalidRule(format!("bad length threshold: {pattern:?}"))),
        }
    }

    fn matches(&self, body: &str, channel: ChannelId, user: Option<UserId>) -> bool {
        match self {
            Predicate::Keywords(terms) => {
                let lowered = body.to_lowercase();
                terms.iter().any(|t| lowered.contains(t.as_str()))
            }
            Predicate::Regex(re) => re.is_match(body),
            Predicate::Users(ids) => user.is_some_and(|u| ids.contains(&u.0)),
            Predicate::Channels(ids) => ids.contains(&channel.0),
            Predicate::MinLength(min) => body.chars().count() >= *min,
        }
    }
}

fn split_terms(pattern: &str) -> impl Iterator<Item = &str> {
    pattern.split(',').map(str::trim).filter(|t| !t.is_empty())
}

fn parse_id_list(pattern: &str) -> Result<HashSet<i64>> {
    let mut out = HashSet::new();
    for term in split_terms(pattern) {
        let id = term
            .parse::<i64>()
            .map_err(|_| Error::InvalidRule(format!("not a numeric id: {term:?}")))?;
        out.insert(id);
    }
    if out.is_empty() {
        return Err(Error::InvalidRule("id list is empty".to_string()));
    }
    Ok(out)
}

#[derive(Debug)]
struct CompiledRule {
    rule: FilterRule,
    predicate: Predicate,
}

/// Rules compiled for one run, highest priority first.
#[derive(Debug, Default)]
pub struct FilterEngine {
    rules: Vec<CompiledRule>,
}

impl FilterEngine {
    /// Compile enabled rules. Ties keep their input order.
    pub fn load(rules: Vec<FilterRule>) -> Self {
        let mut compiled: Vec<CompiledRule> = rules
            .into_iter()
            .filter(|r| r.enabled)
            .filter_map(|rule| match Predicate::compile(rule.kind, &rule.pattern) {
                Ok(predicate) => Some(CompiledRule { rule, predicate }),
                Err(e) => {
                    tracing::warn!(rule_id = rule.id, error = %e, "skipping stored rule");
                    None
                }
            })
            .collect();
        compiled.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
        Self { rules: compiled }
    }

    pub async fn from_store(store: &dyn Store) -> Result<Self> {
        let rules = store.active_filters().await?;
        let engine = Self::load(rules);
        tracing::info!(rules = engine.len(), "filter rules loaded");
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First matching ignore or highlight rule decides; forward matches fall through.
    pub fn evaluate(&self, body: &str, channel: ChannelId, user: Option<UserId>) -> Verdict {
        for compiled in &self.rules {
            if !compiled.predicate.matches(body, channel, user) {
                continue;
            }
            match compiled.rule.action {
                RuleAction::Ignore => return Verdict::Ignored,
                RuleAction::Highlight => return Verdict::Highlight,
                RuleAction::Forward => {}
            }
        }
        Verdict::Forward
    }
}

/// Plain-text table for the `filter list` command.
pub fn render_filter_table(rules: &[FilterRule]) -> String {
    if rules.is_empty() {
        return "No filter rules.\n".to_string();
    }

    let header = ["ID", "Name", "Kind", "Pattern", "Action", "Priority", "Status"];
    let rows: Vec<[String; 7]> = rules
        .iter()
        .map(|r| {
            [
                r.id.to_string(),
                r.name.clone(),
                r.kind.to_string(),
                r.pattern.clone(),
                r.action.to_string(),
                r.priority.to_string(),
                if r.enabled { "enabled" } else { "disabled" }.to_string(),
            ]
        })
        .collect();

    let mut widths = header.map(|h| h.chars().count());
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let push_row = |out: &mut String, cells: &[&str]| {
        let line: Vec<String> = cells
            .iter()
            .zip(widths.iter())
            .map(|(c, w)| format!("{c:<w$}"))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    };

    push_row(&mut out, &header);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let rule_refs: Vec<&str> = rule.iter().map(String::as_str).collect();
    push_row(&mut out, &rule_refs);
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        push_row(&mut out, &cells);
    }
    out
}
