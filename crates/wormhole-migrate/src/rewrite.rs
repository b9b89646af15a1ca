//! Identifier rewriting for checkpointed runtime specs
//!
//! A checkpoint's spec blob carries the identifiers of the host it was taken
//! on: pod UID, CRI sandbox id, API access-token volume, container id,
//! namespace pid and termination-log path. Each [`RewriteRule`] pulls one of
//! those out of the destination placeholder's spec and out of the checkpoint
//! spec, then swaps every occurrence of the old value for the new one.
//!
//! Rules run in order and each one re-extracts from the spec as patched by
//! the rules before it, since an identifier may sit inside a path that an
//! earlier rule rewrote. The patched blob must keep the stored blob's byte
//! length: shorter output is padded with spaces, longer output is an error.

use regex::bytes::Regex;
use std::fmt;
use tracing::{debug, info};

use crate::{MigrateError, Result, SpecDocument};

/// Identifier a rule rewrites, in the order the Kubernetes rule set applies them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    PodUid,
    TerminationLog,
    SandboxId,
    AccessToken,
    ContainerId,
    NamespacePid,
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdentifierKind::PodUid => "pod uid",
            IdentifierKind::TerminationLog => "termination log id",
            IdentifierKind::SandboxId => "sandbox id",
            IdentifierKind::AccessToken => "access token",
            IdentifierKind::ContainerId => "container id",
            IdentifierKind::NamespacePid => "namespace pid",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct RewriteRule {
    kind: IdentifierKind,
    pattern: Regex,
}

impl RewriteRule {
    /// `pattern` must have a capture group; group 1 is the identifier.
    pub fn new(kind: IdentifierKind, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)?;
        if pattern.captures_len() < 2 {
            return Err(MigrateError::RuleWithoutCapture(kind));
        }
        Ok(Self { kind, pattern })
    }

    pub fn kind(&self) -> IdentifierKind {
        self.kind
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// First non-empty capture of the identifier in `document`
    pub fn extract<'a>(&self, document: &'a [u8]) -> Option<&'a [u8]> {
        self.pattern
            .captures(document)
            .and_then(|c| c.get(1))
            .map(|m| m.as_bytes())
            .filter(|id| !id.is_empty())
    }
}

/// Ordered rules, outermost path segments first
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<RewriteRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Self { rules }
    }

    /// Rules for a pod placeholder whose workload container is `workload_name`
    pub fn kubernetes(workload_name: &str) -> Result<Self> {
        let workload = regex::escape(workload_name);
        Ok(Self::new(vec![
            RewriteRule::new(IdentifierKind::PodUid, r"/pods/([^/]+)/etc-hosts")?,
            RewriteRule::new(IdentifierKind::TerminationLog, &format!(r#"/{workload}/([^/"]+)""#))?,
            RewriteRule::new(IdentifierKind::SandboxId, r#"/sandboxes/([^/"]+)/"#)?,
            RewriteRule::new(IdentifierKind::AccessToken, r#"access-([^/"]+)""#)?,
            RewriteRule::new(IdentifierKind::ContainerId, r#"/besteffort/[^"]*/([^/"]+)""#)?,
            RewriteRule::new(IdentifierKind::NamespacePid, r"/proc/([0-9]+)/ns/")?,
        ]))
    }

    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }

    pub fn rewrite(&self, source: &[u8], destination: &[u8]) -> Result<PatchedSpec> {
        rewrite(source, destination, &self.rules)
    }

    pub fn rewrite_within(
        &self,
        source: &[u8],
        destination: &[u8],
        capacity: usize,
    ) -> Result<PatchedSpec> {
        rewrite_within(source, destination, &self.rules, capacity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub rule_index: usize,
    pub kind: IdentifierKind,
    pub old: String,
    pub new: String,
    pub occurrences: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteReport {
    pub substitutions: Vec<Substitution>,
    pub original_len: usize,
    /// Spaces appended to restore the original length
    pub padding: usize,
}

/// Checkpoint spec with every rule applied, same length as the original
#[derive(Debug, Clone)]
pub struct PatchedSpec {
    pub bytes: Vec<u8>,
    pub report: RewriteReport,
}

/// Apply `rules` in order to `source`, taking new values from `destination`.
///
/// All or nothing: the first rule that matches neither document fails the
/// whole rewrite and no patched bytes are produced.
pub fn rewrite(source: &[u8], destination: &[u8], rules: &[RewriteRule]) -> Result<PatchedSpec> {
    rewrite_within(source, destination, rules, source.len())
}

/// [`rewrite`] into a blob of `capacity` bytes, the size the store holds
/// for the spec. The result is padded to exactly `capacity`.
pub fn rewrite_within(
    source: &[u8],
    destination: &[u8],
    rules: &[RewriteRule],
    capacity: usize,
) -> Result<PatchedSpec> {
    let original_len = capacity;
    let mut spec = source.to_vec();
    let mut substitutions = Vec::with_capacity(rules.len());

    for (rule_index, rule) in rules.iter().enumerate() {
        let not_matched = |document| MigrateError::PatternNotMatched {
            rule_index,
            rule: rule.kind(),
            document,
        };
        let new = rule
            .extract(destination)
            .ok_or_else(|| not_matched(SpecDocument::Destination))?
            .to_vec();
        let old = rule
            .extract(&spec)
            .ok_or_else(|| not_matched(SpecDocument::Checkpoint))?
            .to_vec();

        let (patched, occurrences) = replace_literal(&spec, &old, &new);
        spec = patched;

        let substitution = Substitution {
            rule_index,
            kind: rule.kind(),
            old: String::from_utf8_lossy(&old).into_owned(),
            new: String::from_utf8_lossy(&new).into_owned(),
            occurrences,
        };
        debug!(
            rule = %substitution.kind,
            old = %substitution.old,
            new = %substitution.new,
            occurrences,
            "applied rewrite rule"
        );
        substitutions.push(substitution);
    }

    if spec.len() > original_len {
        return Err(MigrateError::LengthOverflow {
            original: original_len,
            patched: spec.len(),
        });
    }
    let padding = original_len - spec.len();
    spec.resize(original_len, b' ');

    info!(rules = rules.len(), padding, "checkpoint spec rewritten");
    Ok(PatchedSpec {
        bytes: spec,
        report: RewriteReport {
            substitutions,
            original_len,
            padding,
        },
    })
}

/// Replace every non-overlapping occurrence of `needle`, left to right.
fn replace_literal(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(haystack.len());
    let mut occurrences = 0;
    let mut i = 0;
    while i < haystack.len() {
        if !needle.is_empty() && haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
            occurrences += 1;
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    (out, occurrences)
}
