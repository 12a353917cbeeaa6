//! Release, unit and file selection rules.
//!
//! A [`Criteria`] holds, per attribute, an ordered list of entries. Each
//! entry either allows the value, denies it (entries prefixed with `-`), or
//! has no opinion. The last entry with an opinion decides; an attribute
//! with no deciding entry rejects. An attribute configured with no entries
//! uses a preset.

use std::collections::BTreeSet;

use aup_catalog::{File, Object, Release, Unit};
use aup_types::FileKind;
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};

use crate::build_info::BuildInfo;

/// Entry that resolves to the running build's value. The value is compared
/// literally, so glob characters in build info match only themselves.
pub const SAME: &str = "same";
/// Entry that allows anything.
pub const ANY: &str = "*";
/// File kind entry for [`FileKind::MINIMAL`].
pub const MINIMAL: &str = "minimal";

/// Raw criteria as written in configuration: attribute → entry strings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriteriaConfig {
    pub src_branch: Vec<String>,
    pub src_revision: Vec<String>,
    pub platform_os: Vec<String>,
    pub platform_arch: Vec<String>,
    pub compiler: Vec<String>,
    pub compiler_version: Vec<String>,
    pub compiler_optimization: Vec<String>,
    pub provider: Vec<String>,
    pub stability: Vec<String>,
    pub signer: Vec<String>,
    pub unit: Vec<String>,
    pub file_kind: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid {attribute} entry {value:?}: {reason}")]
pub struct CriteriaError {
    pub attribute: &'static str,
    pub value: String,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verdict {
    Neutral,
    Allow,
    Deny,
}

/// Split off a leading `-`.
fn split_negation(entry: &str) -> (bool, &str) {
    match entry.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, entry),
    }
}

fn verdict(negate: bool, hit: bool) -> Verdict {
    match (hit, negate) {
        (false, _) => Verdict::Neutral,
        (true, false) => Verdict::Allow,
        (true, true) => Verdict::Deny,
    }
}

fn decide(verdicts: impl Iterator<Item = Verdict>) -> bool {
    verdicts
        .filter(|v| *v != Verdict::Neutral)
        .last()
        .is_some_and(|v| v == Verdict::Allow)
}

/// Entries to parse for an attribute: the configured ones, or the preset.
fn entries_or<'a>(configured: &'a [String], preset: &'a str) -> Vec<&'a str> {
    if configured.is_empty() {
        vec![preset]
    } else {
        configured.iter().map(String::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// Entry types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum StringPattern {
    Any,
    Literal(String),
    Glob(GlobMatcher),
}

/// Glob over a string attribute.
#[derive(Clone, Debug)]
struct StringEntry {
    negate: bool,
    pattern: StringPattern,
}

impl StringEntry {
    /// `path_mode` makes `*` stop at `/` and treats backslash literally.
    fn parse(
        attribute: &'static str,
        entry: &str,
        same: &str,
        path_mode: bool,
    ) -> Result<Self, CriteriaError> {
        let (negate, body) = split_negation(entry);
        if body.is_empty() {
            return Err(CriteriaError {
                attribute,
                value: entry.to_string(),
                reason: "empty pattern".to_string(),
            });
        }
        let pattern = match body {
            ANY => StringPattern::Any,
            SAME => StringPattern::Literal(same.to_string()),
            glob => {
                let matcher = GlobBuilder::new(glob)
                    .literal_separator(path_mode)
                    .backslash_escape(!path_mode)
                    .build()
                    .map_err(|e| CriteriaError {
                        attribute,
                        value: entry.to_string(),
                        reason: e.to_string(),
                    })?
                    .compile_matcher();
                StringPattern::Glob(matcher)
            }
        };
        Ok(Self { negate, pattern })
    }

    fn verdict(&self, value: &str) -> Verdict {
        let hit = match &self.pattern {
            StringPattern::Any => true,
            StringPattern::Literal(s) => s == value,
            StringPattern::Glob(m) => m.is_match(value),
        };
        verdict(self.negate, hit)
    }
}

/// Inclusive numeric range: `*`, `N`, or `A-B`.
#[derive(Clone, Debug, PartialEq, Eq)]
struct RangeEntry {
    negate: bool,
    min: u32,
    max: u32,
}

impl RangeEntry {
    fn parse(attribute: &'static str, entry: &str) -> Result<Self, CriteriaError> {
        let (negate, body) = split_negation(entry);
        let err = |reason: &str| CriteriaError {
            attribute,
            value: entry.to_string(),
            reason: reason.to_string(),
        };
        let number = |s: &str| s.trim().parse::<u32>().map_err(|_| err("not a number"));
        let (min, max) = if body == ANY {
            (u32::MIN, u32::MAX)
        } else if let Some((a, b)) = body.split_once('-') {
            (number(a)?, number(b)?)
        } else {
            let n = number(body)?;
            (n, n)
        };
        if min > max {
            return Err(err("range minimum exceeds maximum"));
        }
        Ok(Self { negate, min, max })
    }

    fn verdict(&self, value: u32) -> Verdict {
        verdict(self.negate, (self.min..=self.max).contains(&value))
    }
}

/// Exact signer key: `*` or 64 hex characters.
#[derive(Clone, Debug, PartialEq, Eq)]
struct KeyEntry {
    negate: bool,
    key: Option<[u8; 32]>,
}

impl KeyEntry {
    fn parse(attribute: &'static str, entry: &str) -> Result<Self, CriteriaError> {
        let (negate, body) = split_negation(entry);
        if body == ANY {
            return Ok(Self { negate, key: None });
        }
        let key = hex::decode(body)
            .ok()
            .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
            .ok_or_else(|| CriteriaError {
                attribute,
                value: entry.to_string(),
                reason: "expected 64 hex characters".to_string(),
            })?;
        Ok(Self {
            negate,
            key: Some(key),
        })
    }

    fn verdict(&self, value: &[u8; 32]) -> Verdict {
        verdict(self.negate, self.key.map_or(true, |k| &k == value))
    }
}

/// File kind set: `*`, `minimal`, or one kind name.
#[derive(Clone, Debug, PartialEq, Eq)]
struct KindEntry {
    negate: bool,
    kinds: BTreeSet<FileKind>,
}

impl KindEntry {
    fn parse(attribute: &'static str, entry: &str) -> Result<Self, CriteriaError> {
        let (negate, body) = split_negation(entry);
        let kinds = match body {
            ANY => FileKind::ALL.into_iter().collect(),
            MINIMAL => FileKind::MINIMAL.into_iter().collect(),
            name => {
                let kind = name.parse::<FileKind>().map_err(|e| CriteriaError {
                    attribute,
                    value: entry.to_string(),
                    reason: e.to_string(),
                })?;
                [kind].into_iter().collect()
            }
        };
        Ok(Self { negate, kinds })
    }

    fn verdict(&self, kind: FileKind) -> Verdict {
        verdict(self.negate, self.kinds.contains(&kind))
    }
}

// ---------------------------------------------------------------------------
// Criteria
// ---------------------------------------------------------------------------

/// One compiled selection rule.
#[derive(Clone, Debug)]
pub struct Criteria {
    src_branch: Vec<StringEntry>,
    src_revision: Vec<StringEntry>,
    platform_os: Vec<StringEntry>,
    platform_arch: Vec<StringEntry>,
    compiler: Vec<StringEntry>,
    compiler_version: Vec<StringEntry>,
    compiler_optimization: Vec<StringEntry>,
    provider: Vec<StringEntry>,
    stability: Vec<RangeEntry>,
    signer: Vec<KeyEntry>,
    unit: Vec<StringEntry>,
    file_kind: Vec<KindEntry>,
}

impl Criteria {
    /// Compile `config`, resolving `same` against `info`.
    pub fn parse(config: &CriteriaConfig, info: &BuildInfo) -> Result<Self, CriteriaError> {
        let strings = |attribute: &'static str,
                       configured: &[String],
                       preset: &str,
                       same: &str,
                       path_mode: bool|
         -> Result<Vec<StringEntry>, CriteriaError> {
            entries_or(configured, preset)
                .into_iter()
                .map(|e| StringEntry::parse(attribute, e, same, path_mode))
                .collect()
        };

        Ok(Self {
            src_branch: strings("src_branch", &config.src_branch, SAME, &info.src_branch, true)?,
            src_revision: strings("src_revision", &config.src_revision, ANY, &info.src_revision, false)?,
            platform_os: strings("platform_os", &config.platform_os, SAME, &info.platform_os, false)?,
            platform_arch: strings("platform_arch", &config.platform_arch, SAME, &info.platform_arch, false)?,
            compiler: strings("compiler", &config.compiler, SAME, &info.compiler, false)?,
            compiler_version: strings(
                "compiler_version",
                &config.compiler_version,
                ANY,
                &info.compiler_version,
                false,
            )?,
            compiler_optimization: strings(
                "compiler_optimization",
                &config.compiler_optimization,
                SAME,
                &info.compiler_optimization,
                false,
            )?,
            provider: strings("provider", &config.provider, SAME, &info.provider, false)?,
            stability: entries_or(&config.stability, ANY)
                .into_iter()
                .map(|e| RangeEntry::parse("stability", e))
                .collect::<Result<_, _>>()?,
            signer: entries_or(&config.signer, ANY)
                .into_iter()
                .map(|e| KeyEntry::parse("signer", e))
                .collect::<Result<_, _>>()?,
            unit: strings("unit", &config.unit, ANY, "", false)?,
            file_kind: entries_or(&config.file_kind, MINIMAL)
                .into_iter()
                .map(|e| KindEntry::parse("file_kind", e))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Every release attribute must be allowed.
    pub fn matches_release(&self, release: &Release) -> bool {
        let text = |entries: &[StringEntry], value: &str| {
            decide(entries.iter().map(|e| e.verdict(value)))
        };
        text(&self.src_branch, &release.src_branch)
            && text(&self.src_revision, &release.src_revision)
            && text(&self.platform_os, &release.platform_os)
            && text(&self.platform_arch, &release.platform_arch)
            && text(&self.compiler, &release.compiler)
            && text(&self.compiler_version, &release.compiler_version)
            && text(&self.compiler_optimization, &release.compiler_optimization)
            && text(&self.provider, &release.provider)
            && decide(self.stability.iter().map(|e| e.verdict(release.stability)))
            && decide(self.signer.iter().map(|e| e.verdict(&release.signer)))
    }

    pub fn matches_unit(&self, unit: &Unit) -> bool {
        decide(self.unit.iter().map(|e| e.verdict(&unit.name)))
    }

    pub fn matches_file(&self, file: &File) -> bool {
        self.matches_kind(file.kind)
    }

    pub fn matches_kind(&self, kind: FileKind) -> bool {
        decide(self.file_kind.iter().map(|e| e.verdict(kind)))
    }

    pub fn matches(&self, object: &Object) -> bool {
        match object {
            Object::Release(r) => self.matches_release(r),
            Object::Unit(u) => self.matches_unit(u),
            Object::File(f) => self.matches_file(f),
        }
    }

    /// Kinds this criteria installs.
    pub fn allowed_kinds(&self) -> BTreeSet<FileKind> {
        FileKind::ALL
            .into_iter()
            .filter(|kind| self.matches_kind(*kind))
            .collect()
    }
}

/// The criteria of one audience. An object is selected if any member
/// matches it.
#[derive(Clone, Debug, Default)]
pub struct CriteriaSet(Vec<Criteria>);

impl CriteriaSet {
    pub fn parse(configs: &[CriteriaConfig], info: &BuildInfo) -> Result<Self, CriteriaError> {
        configs
            .iter()
            .map(|c| Criteria::parse(c, info))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn matches(&self, object: &Object) -> bool {
        self.0.iter().any(|c| c.matches(object))
    }

    pub fn matches_release(&self, release: &Release) -> bool {
        self.0.iter().any(|c| c.matches_release(release))
    }

    pub fn matches_unit(&self, unit: &Unit) -> bool {
        self.0.iter().any(|c| c.matches_unit(unit))
    }

    /// Union of kinds allowed by the members that select `unit`.
    pub fn unit_kinds(&self, unit: &Unit) -> BTreeSet<FileKind> {
        self.0
            .iter()
            .filter(|c| c.matches_unit(unit))
            .flat_map(Criteria::allowed_kinds)
            .collect()
    }
}

impl From<Vec<Criteria>> for CriteriaSet {
    fn from(criteria: Vec<Criteria>) -> Self {
        Self(criteria)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> BuildInfo {
        BuildInfo {
            src_branch: "main".into(),
            src_revision: "r1".into(),
            platform_os: "linux".into(),
            platform_arch: "x86_64".into(),
            compiler: "rustc".into(),
            compiler_version: "1.80".into(),
            compiler_optimization: "release".into(),
            provider: "acme".into(),
        }
    }

    fn release() -> Release {
        let i = info();
        Release {
            src_branch: i.src_branch,
            src_revision: "r7".into(),
            platform_os: i.platform_os,
            platform_arch: i.platform_arch,
            compiler: i.compiler,
            compiler_version: "1.81".into(),
            compiler_optimization: i.compiler_optimization,
            provider: i.provider,
            stability: 2,
            ..Default::default()
        }
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_select_same_platform() {
        let c = Criteria::parse(&CriteriaConfig::default(), &info()).unwrap();
        assert!(c.matches_release(&release()));

        let mut other_os = release();
        other_os.platform_os = "windows".into();
        assert!(!c.matches_release(&other_os));

        let mut other_provider = release();
        other_provider.provider = "beta".into();
        assert!(!c.matches_release(&other_provider));
    }

    #[test]
    fn default_kinds_are_minimal() {
        let c = Criteria::parse(&CriteriaConfig::default(), &info()).unwrap();
        assert_eq!(c.allowed_kinds(), FileKind::MINIMAL.into_iter().collect());
    }

    #[test]
    fn last_deciding_entry_wins() {
        let config = CriteriaConfig {
            provider: strings(&["*", "-beta*", "beta-trusted"]),
            ..Default::default()
        };
        let c = Criteria::parse(&config, &info()).unwrap();
        let with = |p: &str| {
            let mut r = release();
            r.provider = p.into();
            c.matches_release(&r)
        };
        assert!(with("acme"));
        assert!(!with("beta-1"));
        assert!(with("beta-trusted"));
    }

    #[test]
    fn only_negative_entries_reject_everything() {
        let config = CriteriaConfig {
            unit: strings(&["-debug*"]),
            ..Default::default()
        };
        let c = Criteria::parse(&config, &info()).unwrap();
        let unit = Unit {
            name: "core".into(),
            ..Default::default()
        };
        assert!(!c.matches_unit(&unit));
    }

    #[test]
    fn empty_string_entries_are_rejected() {
        for entry in ["", "-"] {
            let config = CriteriaConfig {
                provider: strings(&[entry]),
                ..Default::default()
            };
            let err = Criteria::parse(&config, &info()).unwrap_err();
            assert_eq!(err.attribute, "provider");
            assert_eq!(err.value, entry);
        }
    }

    #[test]
    fn same_compares_build_value_literally() {
        let mut build = info();
        build.provider = "acme-[ab]".into();
        let c = Criteria::parse(&CriteriaConfig::default(), &build).unwrap();
        let with = |p: &str| {
            let mut r = release();
            r.provider = p.into();
            c.matches_release(&r)
        };
        assert!(with("acme-[ab]"));
        assert!(!with("acme-a"));
    }

    #[test]
    fn branch_glob_uses_path_mode() {
        let config = CriteriaConfig {
            src_branch: strings(&["release/*"]),
            ..Default::default()
        };
        let c = Criteria::parse(&config, &info()).unwrap();
        let with = |b: &str| {
            let mut r = release();
            r.src_branch = b.into();
            c.matches_release(&r)
        };
        assert!(with("release/1.0"));
        assert!(!with("release/1.0/hotfix"));
        assert!(!with("main"));
    }

    #[test]
    fn string_glob_crosses_separator_outside_branch() {
        let config = CriteriaConfig {
            unit: strings(&["lib*"]),
            ..Default::default()
        };
        let c = Criteria::parse(&config, &info()).unwrap();
        let unit = Unit {
            name: "lib/core".into(),
            ..Default::default()
        };
        assert!(c.matches_unit(&unit));
    }

    #[test]
    fn stability_ranges() {
        assert_eq!(
            RangeEntry::parse("stability", "1-3").unwrap(),
            RangeEntry { negate: false, min: 1, max: 3 }
        );
        assert_eq!(
            RangeEntry::parse("stability", "-5").unwrap(),
            RangeEntry { negate: true, min: 5, max: 5 }
        );
        assert!(RangeEntry::parse("stability", "3-1").is_err());
        assert!(RangeEntry::parse("stability", "high").is_err());

        let config = CriteriaConfig {
            stability: strings(&["0-10", "-2"]),
            ..Default::default()
        };
        let c = Criteria::parse(&config, &info()).unwrap();
        assert!(!c.matches_release(&release()));
    }

    #[test]
    fn signer_keys() {
        let key = [7u8; 32];
        let config = CriteriaConfig {
            signer: vec![hex::encode(key)],
            ..Default::default()
        };
        let c = Criteria::parse(&config, &info()).unwrap();
        let mut r = release();
        assert!(!c.matches_release(&r));
        r.signer = key;
        assert!(c.matches_release(&r));

        let err = KeyEntry::parse("signer", "abcd").unwrap_err();
        assert_eq!(err.attribute, "signer");
    }

    #[test]
    fn kind_entries() {
        let config = CriteriaConfig {
            file_kind: strings(&["*", "-src", "-test"]),
            ..Default::default()
        };
        let c = Criteria::parse(&config, &info()).unwrap();
        let kinds = c.allowed_kinds();
        assert!(kinds.contains(&FileKind::Debug));
        assert!(!kinds.contains(&FileKind::Src));
        assert!(!kinds.contains(&FileKind::Test));
        assert!(KindEntry::parse("file_kind", "binary").is_err());
    }

    #[test]
    fn set_matches_any_member() {
        let beta = CriteriaConfig {
            provider: strings(&["beta"]),
            file_kind: strings(&["debug"]),
            ..Default::default()
        };
        let set = CriteriaSet::parse(&[CriteriaConfig::default(), beta], &info()).unwrap();
        let mut r = release();
        assert!(set.matches(&Object::Release(r.clone())));
        r.provider = "beta".into();
        assert!(set.matches(&Object::Release(r)));

        let kinds = set.unit_kinds(&Unit::default());
        assert!(kinds.contains(&FileKind::Debug));
        assert!(kinds.contains(&FileKind::Runtime));
        assert!(!CriteriaSet::default().matches(&Object::Unit(Unit::default())));
    }
}
