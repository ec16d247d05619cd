//! Comparing parser output with the ground truth.
//!
//! [`compare`] pairs every ground truth record with at most one parsed
//! object and checks the fields selected by the [`ComparisonPolicy`] one by
//! one, so a single wrong field never hides the state of the others.
//! [`summarize`] folds the verdicts into a [`TestResult`].
//!
//! Pairing happens in two stages.  The first uses the policy's primary key
//! (object identity by default, or the path).  Records the first stage could
//! not pair get a second chance using the other key, which covers parsers
//! that number inodes differently inside subvolumes or report no volume at
//! all.  When several candidates share a key (hard links), candidates at the
//! same path pair first; the rest pair in path order, live records first.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

use serde::{Deserialize, Serialize};

use crate::{
    object::{
        DeleteIntent, GroundTruthObject, ObjectKey, ObjectKind, ParsedObject, ParsedStatus,
        Timestamp, TruthStatus,
    },
    util::is_within,
};

/// A comparable fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Kind,
    Name,
    Parent,
    Size,
    Fingerprint,
    Mode,
    Uid,
    Gid,
    Nlink,
    SymlinkTarget,
    /// Live, deleted or orphaned.
    Status,
    Mtime,
    Atime,
    Ctime,
    Crtime,
    DataRanges,
}

impl Field {
    pub const ALL: [Field; 16] = [
        Field::Kind,
        Field::Name,
        Field::Parent,
        Field::Size,
        Field::Fingerprint,
        Field::Mode,
        Field::Uid,
        Field::Gid,
        Field::Nlink,
        Field::SymlinkTarget,
        Field::Status,
        Field::Mtime,
        Field::Atime,
        Field::Ctime,
        Field::Crtime,
        Field::DataRanges,
    ];

    /// Everything except data ranges and creation time, which few parsers
    /// report.
    pub fn defaults() -> BTreeSet<Field> {
        Field::ALL
            .into_iter()
            .filter(|f| !matches!(f, Field::DataRanges | Field::Crtime))
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Kind => "kind",
            Field::Name => "name",
            Field::Parent => "parent",
            Field::Size => "size",
            Field::Fingerprint => "fingerprint",
            Field::Mode => "mode",
            Field::Uid => "uid",
            Field::Gid => "gid",
            Field::Nlink => "nlink",
            Field::SymlinkTarget => "symlink_target",
            Field::Status => "status",
            Field::Mtime => "mtime",
            Field::Atime => "atime",
            Field::Ctime => "ctime",
            Field::Crtime => "crtime",
            Field::DataRanges => "data_ranges",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampPrecision {
    /// Sub-second parts are ignored.
    #[default]
    Seconds,
    Nanoseconds,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pairing {
    /// Object id plus volume, falling back to the path.
    #[default]
    Identity,
    /// Path, falling back to object id plus volume.
    Path,
}

/// Parsed objects a scenario expects the parser to report on top of the
/// ground truth, such as filesystem-internal metadata.
///
/// Ignore rules only excuse parsed objects nothing was paired with; they
/// never hide a mismatch or a missing object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreRule {
    /// Any path component starting with the prefix, e.g. `$` for the
    /// virtual entries of The Sleuth Kit.
    NamePrefix(String),
    /// The path contains the text anywhere.
    PathContains(String),
    /// The path is the prefix or lies below it.
    PathPrefix(String),
}

impl IgnoreRule {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            IgnoreRule::NamePrefix(prefix) => path
                .split('/')
                .any(|component| !component.is_empty() && component.starts_with(prefix.as_str())),
            IgnoreRule::PathContains(text) => path.contains(text.as_str()),
            IgnoreRule::PathPrefix(prefix) => is_within(path, prefix),
        }
    }
}

/// How a scenario wants its objects compared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonPolicy {
    pub fields: BTreeSet<Field>,
    /// Do not compare the size of directories and subvolume roots.
    pub ignore_directory_size: bool,
    pub ignore: Vec<IgnoreRule>,
    pub timestamp_precision: TimestampPrecision,
    pub pairing: Pairing,
    /// Accept a subvolume root reported as a plain directory.
    pub lenient_subvolume_kind: bool,
}

impl Default for ComparisonPolicy {
    fn default() -> Self {
        ComparisonPolicy {
            fields: Field::defaults(),
            ignore_directory_size: false,
            ignore: vec![],
            timestamp_precision: TimestampPrecision::default(),
            pairing: Pairing::default(),
            lenient_subvolume_kind: true,
        }
    }
}

impl ComparisonPolicy {
    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignore.iter().any(|rule| rule.matches(path))
    }

    pub fn compares(&self, field: Field) -> bool {
        self.fields.contains(&field)
    }
}

/// Which object a verdict is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<ObjectKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Set for ground truth records of deleted objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DeleteIntent>,
    /// What the parser reported as wrong with its counterpart, if anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl ObjectRef {
    fn truth(object: &GroundTruthObject, parsed: Option<&ParsedObject>) -> Self {
        ObjectRef {
            key: Some(object.key),
            path: object.facts.path.clone(),
            deleted: match object.status {
                TruthStatus::Live => None,
                TruthStatus::Deleted { intent, .. } => Some(intent),
            },
            parse_error: parsed.and_then(|p| p.parse_error.clone()),
        }
    }

    fn parsed(object: &ParsedObject) -> Self {
        ObjectRef {
            key: object.key,
            path: object.facts.path.clone(),
            deleted: None,
            parse_error: object.parse_error.clone(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path.as_deref().unwrap_or("<no path>"))?;
        if let Some(key) = self.key {
            write!(f, " ({key})")?;
        }
        match self.deleted {
            Some(DeleteIntent::HardDelete) => f.write_str(" [deleted]"),
            Some(DeleteIntent::OrphanRecoverable) => f.write_str(" [orphan]"),
            None => Ok(()),
        }
    }
}

/// One field that differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: Field,
    pub expected: String,
    /// `None` if the parser did not report the field.
    pub actual: Option<String>,
}

impl fmt::Display for FieldDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, got {}",
            self.field,
            self.expected,
            self.actual.as_deref().unwrap_or("nothing")
        )
    }
}

/// Outcome for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Match { object: ObjectRef },
    Mismatch { object: ObjectRef, diffs: Vec<FieldDiff> },
    /// A ground truth record the parser did not report.
    Missing { object: ObjectRef },
    /// A parsed object with no ground truth counterpart, or a hard-deleted
    /// object the parser still reports as live.
    Unexpected { object: ObjectRef },
}

impl Verdict {
    pub fn object(&self) -> &ObjectRef {
        match self {
            Verdict::Match { object }
            | Verdict::Mismatch { object, .. }
            | Verdict::Missing { object }
            | Verdict::Unexpected { object } => object,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match { .. })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Match { object } => write!(f, "match {object}"),
            Verdict::Mismatch { object, diffs } => {
                write!(f, "mismatch {object}:")?;
                for (i, diff) in diffs.iter().enumerate() {
                    let sep = if i == 0 { " " } else { "; " };
                    write!(f, "{sep}{diff}")?;
                }
                Ok(())
            }
            Verdict::Missing { object } => write!(f, "missing {object}"),
            Verdict::Unexpected { object } => write!(f, "unexpected {object}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum By {
    Identity,
    Path,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PairKey<'a> {
    Identity(ObjectKey),
    Path(&'a str),
}

fn truth_key(object: &GroundTruthObject, by: By) -> Option<PairKey<'_>> {
    match by {
        By::Identity => Some(PairKey::Identity(object.key)),
        By::Path => object.facts.path.as_deref().map(PairKey::Path),
    }
}

fn parsed_key(object: &ParsedObject, by: By) -> Option<PairKey<'_>> {
    match by {
        By::Identity => object.key.map(PairKey::Identity),
        By::Path => object.path().map(PairKey::Path),
    }
}

/// Pairing state: for each ground truth record, its parsed partner and how
/// the pair was made.
struct Pairs {
    truth: Vec<Option<(usize, By)>>,
    used: Vec<bool>,
}

impl Pairs {
    fn stage(&mut self, by: By, truth: &[GroundTruthObject], parsed: &[ParsedObject]) {
        let mut candidates: HashMap<PairKey<'_>, Vec<usize>> = HashMap::new();
        for (index, object) in parsed.iter().enumerate() {
            if self.used[index] {
                continue;
            }
            if let Some(key) = parsed_key(object, by) {
                candidates.entry(key).or_default().push(index);
            }
        }

        let mut groups: HashMap<PairKey<'_>, Vec<usize>> = HashMap::new();
        for (index, object) in truth.iter().enumerate() {
            if self.truth[index].is_some() {
                continue;
            }
            if let Some(key) = truth_key(object, by) {
                if candidates.contains_key(&key) {
                    groups.entry(key).or_default().push(index);
                }
            }
        }

        for (key, mut wanted) in groups {
            let Some(mut offered) = candidates.remove(&key) else {
                continue;
            };

            // same path first
            wanted.retain(|&t| {
                let path = truth[t].facts.path.as_deref();
                match offered.iter().position(|&p| path.is_some() && parsed[p].path() == path) {
                    Some(pos) => {
                        self.pair(t, offered.remove(pos), by);
                        false
                    }
                    None => true,
                }
            });

            wanted.sort_by(|&a, &b| {
                let (a, b) = (&truth[a], &truth[b]);
                (!a.is_live(), a.path()).cmp(&(!b.is_live(), b.path()))
            });
            offered.sort_by(|&a, &b| {
                let (a, b) = (&parsed[a], &parsed[b]);
                (a.status != ParsedStatus::Live, a.path()).cmp(&(b.status != ParsedStatus::Live, b.path()))
            });
            for (t, p) in wanted.into_iter().zip(offered) {
                self.pair(t, p, by);
            }
        }
    }

    fn pair(&mut self, truth: usize, parsed: usize, by: By) {
        self.truth[truth] = Some((parsed, by));
        self.used[parsed] = true;
    }
}

fn render<T: fmt::Display>(value: &Option<T>) -> Option<String> {
    value.as_ref().map(T::to_string)
}

fn check<T: PartialEq + fmt::Display>(
    diffs: &mut Vec<FieldDiff>,
    field: Field,
    expected: &Option<T>,
    actual: &Option<T>,
) {
    check_with(diffs, field, expected, actual, |a, b| a == b);
}

fn check_with<T: fmt::Display>(
    diffs: &mut Vec<FieldDiff>,
    field: Field,
    expected: &Option<T>,
    actual: &Option<T>,
    same: impl Fn(&T, &T) -> bool,
) {
    let Some(want) = expected else {
        return;
    };
    let equal = actual.as_ref().is_some_and(|got| same(want, got));
    if !equal {
        diffs.push(FieldDiff {
            field,
            expected: want.to_string(),
            actual: render(actual),
        });
    }
}

struct Ranges<'a>(&'a [crate::object::ByteRange]);

impl fmt::Display for Ranges<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, range) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            range.fmt(f)?;
        }
        f.write_str("]")
    }
}

fn expected_status(status: TruthStatus) -> ParsedStatus {
    match status {
        TruthStatus::Live => ParsedStatus::Live,
        TruthStatus::Deleted {
            intent: DeleteIntent::OrphanRecoverable,
            ..
        } => ParsedStatus::Orphan,
        TruthStatus::Deleted { .. } => ParsedStatus::Deleted,
    }
}

/// The field by field differences between a record and its partner.
fn diff_fields(
    truth: &GroundTruthObject,
    parsed: &ParsedObject,
    by: By,
    policy: &ComparisonPolicy,
) -> Vec<FieldDiff> {
    let (want, got) = (&truth.facts, &parsed.facts);
    let mut diffs = vec![];

    let timestamp = |ts: &Option<Timestamp>| match policy.timestamp_precision {
        TimestampPrecision::Seconds => ts.map(Timestamp::whole_seconds),
        TimestampPrecision::Nanoseconds => *ts,
    };
    let container = want.kind.is_some_and(|k| k.is_container());
    // an orphan has lost its name and parent; its link count and ctime
    // changed when it was unlinked
    let orphan = matches!(
        truth.status,
        TruthStatus::Deleted {
            intent: DeleteIntent::OrphanRecoverable,
            ..
        }
    );

    for &field in &policy.fields {
        match field {
            Field::Name | Field::Parent | Field::Nlink | Field::Ctime if orphan => {}
            Field::Kind => check_with(&mut diffs, field, &want.kind, &got.kind, |a, b| {
                a == b
                    || (policy.lenient_subvolume_kind
                        && *a == ObjectKind::SubvolumeRoot
                        && *b == ObjectKind::Directory)
            }),
            Field::Name => check(&mut diffs, field, &want.name, &got.name),
            Field::Parent => check_with(&mut diffs, field, &want.parent, &got.parent, |a, b| {
                match by {
                    By::Identity => a == b,
                    // the pair itself may be numbered differently
                    By::Path => a.same_inode(b),
                }
            }),
            Field::Size if container && policy.ignore_directory_size => {}
            Field::Size => check(&mut diffs, field, &want.size, &got.size),
            Field::Fingerprint => {
                check_with(&mut diffs, field, &want.fingerprint, &got.fingerprint, |a, b| {
                    a.eq_ignore_ascii_case(b)
                })
            }
            Field::Mode => check_with(&mut diffs, field, &want.mode, &got.mode, |a, b| {
                a & 0o7777 == b & 0o7777
            }),
            Field::Uid => check(&mut diffs, field, &want.uid, &got.uid),
            Field::Gid => check(&mut diffs, field, &want.gid, &got.gid),
            Field::Nlink => check(&mut diffs, field, &want.nlink, &got.nlink),
            Field::SymlinkTarget => {
                check(&mut diffs, field, &want.symlink_target, &got.symlink_target)
            }
            Field::Status => {
                let expected = expected_status(truth.status);
                check_with(&mut diffs, field, &Some(expected), &Some(parsed.status), |a, b| {
                    a == b || (*a == ParsedStatus::Orphan && *b == ParsedStatus::Deleted)
                })
            }
            Field::Mtime => check(&mut diffs, field, &timestamp(&want.mtime), &timestamp(&got.mtime)),
            Field::Atime => check(&mut diffs, field, &timestamp(&want.atime), &timestamp(&got.atime)),
            Field::Ctime => check(&mut diffs, field, &timestamp(&want.ctime), &timestamp(&got.ctime)),
            Field::Crtime => check(
                &mut diffs,
                field,
                &timestamp(&want.crtime),
                &timestamp(&got.crtime),
            ),
            Field::DataRanges => {
                let expected = want.data_ranges.as_deref().map(Ranges);
                let actual = got.data_ranges.as_deref().map(Ranges);
                check_with(&mut diffs, field, &expected, &actual, |a, b| a.0 == b.0)
            }
        }
    }
    diffs
}

fn field_verdict(object: ObjectRef, diffs: Vec<FieldDiff>) -> Verdict {
    if diffs.is_empty() {
        Verdict::Match { object }
    } else {
        Verdict::Mismatch { object, diffs }
    }
}

/// Compares the parser's objects with the ground truth.
///
/// Every ground truth record yields exactly one verdict; every parsed object
/// left unpaired yields an `unexpected` verdict unless an ignore rule covers
/// it.
pub fn compare(
    truth: &[GroundTruthObject],
    parsed: &[ParsedObject],
    policy: &ComparisonPolicy,
) -> Vec<Verdict> {
    let mut pairs = Pairs {
        truth: vec![None; truth.len()],
        used: vec![false; parsed.len()],
    };
    let (primary, fallback) = match policy.pairing {
        Pairing::Identity => (By::Identity, By::Path),
        Pairing::Path => (By::Path, By::Identity),
    };
    pairs.stage(primary, truth, parsed);
    pairs.stage(fallback, truth, parsed);

    let mut verdicts = Vec::with_capacity(truth.len());
    for (object, pair) in truth.iter().zip(&pairs.truth) {
        let partner = pair.map(|(p, by)| (&parsed[p], by));
        let reference = ObjectRef::truth(object, partner.map(|(p, _)| p));

        let verdict = match (object.status, partner) {
            (TruthStatus::Live, None) => Verdict::Missing { object: reference },
            (TruthStatus::Live, Some((p, by))) => {
                field_verdict(reference, diff_fields(object, p, by, policy))
            }
            (
                TruthStatus::Deleted {
                    intent: DeleteIntent::HardDelete,
                    ..
                },
                partner,
            ) => match partner {
                Some((p, _)) if p.status == ParsedStatus::Live => {
                    Verdict::Unexpected { object: reference }
                }
                _ => Verdict::Match { object: reference },
            },
            (
                TruthStatus::Deleted {
                    intent: DeleteIntent::OrphanRecoverable,
                    ..
                },
                None,
            ) => Verdict::Missing { object: reference },
            (TruthStatus::Deleted { .. }, Some((p, by))) => {
                field_verdict(reference, diff_fields(object, p, by, policy))
            }
        };
        verdicts.push(verdict);
    }

    for (object, used) in parsed.iter().zip(&pairs.used) {
        if *used {
            continue;
        }
        if object.path().is_some_and(|path| policy.is_ignored(path)) {
            continue;
        }
        verdicts.push(Verdict::Unexpected {
            object: ObjectRef::parsed(object),
        });
    }
    verdicts
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictCounts {
    pub matched: usize,
    pub mismatched: usize,
    pub missing: usize,
    pub unexpected: usize,
}

/// The result of one scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: bool,
    pub counts: VerdictCounts,
    /// Every verdict that is not a match.
    pub failures: Vec<Verdict>,
    /// Problems the parser reported for individual objects.
    pub parse_errors: Vec<String>,
}

/// Aggregates verdicts: the scenario passes iff everything matched.
pub fn summarize(verdicts: &[Verdict]) -> TestResult {
    let mut counts = VerdictCounts::default();
    let mut failures = vec![];
    let mut parse_errors = vec![];

    for verdict in verdicts {
        match verdict {
            Verdict::Match { .. } => counts.matched += 1,
            Verdict::Mismatch { .. } => counts.mismatched += 1,
            Verdict::Missing { .. } => counts.missing += 1,
            Verdict::Unexpected { .. } => counts.unexpected += 1,
        }
        if !verdict.is_match() {
            failures.push(verdict.clone());
        }
        let object = verdict.object();
        if let Some(error) = &object.parse_error {
            parse_errors.push(format!("{object}: {error}"));
        }
    }

    TestResult {
        passed: failures.is_empty(),
        counts,
        failures,
        parse_errors,
    }
}

/// [`compare`] followed by [`summarize`].
pub fn verify(
    truth: &[GroundTruthObject],
    parsed: &[ParsedObject],
    policy: &ComparisonPolicy,
) -> TestResult {
    summarize(&compare(truth, parsed, policy))
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let VerdictCounts {
            matched,
            mismatched,
            missing,
            unexpected,
        } = self.counts;
        writeln!(
            f,
            "{}: {matched} matched, {mismatched} mismatched, {missing} missing, {unexpected} unexpected",
            if self.passed { "PASS" } else { "FAIL" }
        )?;
        for failure in &self.failures {
            writeln!(f, "  {failure}")?;
        }
        for error in &self.parse_errors {
            writeln!(f, "  parse error: {error}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::object::{ObjectFacts, ParentRef};

    fn key(id: u64) -> ObjectKey {
        ObjectKey::new(5, id)
    }

    fn facts(kind: ObjectKind, path: &str, parent: ParentRef) -> ObjectFacts {
        ObjectFacts {
            kind: Some(kind),
            name: Some(crate::util::file_name(path).into()),
            path: Some(path.into()),
            parent: Some(parent),
            size: Some(10),
            mode: Some(0o644),
            ..Default::default()
        }
    }

    fn truth(id: u64, kind: ObjectKind, path: &str, parent: ParentRef) -> GroundTruthObject {
        GroundTruthObject::live(key(id), facts(kind, path, parent), 0)
    }

    fn parsed_from(object: &GroundTruthObject) -> ParsedObject {
        ParsedObject {
            key: Some(object.key),
            facts: object.facts.clone(),
            ..Default::default()
        }
    }

    #[test]
    fn test_field_defaults() {
        let defaults = Field::defaults();
        assert!(defaults.contains(&Field::Fingerprint));
        assert!(!defaults.contains(&Field::DataRanges));
        assert!(!defaults.contains(&Field::Crtime));
        assert_eq!(defaults.len(), 14);

        let policy = ComparisonPolicy::default();
        assert!(policy.compares(Field::Mtime));
        assert!(!policy.compares(Field::DataRanges));
    }

    #[test]
    fn test_ignore_rules() {
        assert!(IgnoreRule::NamePrefix("$".into()).matches("/$OrphanFiles/OrphanFile-12"));
        assert!(!IgnoreRule::NamePrefix("$".into()).matches("/a$b"));
        assert!(IgnoreRule::PathContains("ext2_saved".into()).matches("/ext2_saved/image"));
        assert!(IgnoreRule::PathPrefix("/lost+found".into()).matches("/lost+found"));
        assert!(!IgnoreRule::PathPrefix("/lost+found".into()).matches("/lost+found2"));
    }

    #[test]
    fn test_every_field_reported() {
        let dir = truth(257, ObjectKind::Directory, "/a", ParentRef::Root);
        let file = truth(258, ObjectKind::File, "/a/f", ParentRef::Object(key(257)));
        let mut wrong = parsed_from(&file);
        wrong.facts.size = Some(0);
        wrong.facts.mode = None;

        let verdicts = compare(
            &[dir.clone(), file],
            &[parsed_from(&dir), wrong],
            &ComparisonPolicy::default(),
        );
        assert_eq!(verdicts.len(), 2);
        assert!(verdicts[0].is_match());
        match &verdicts[1] {
            Verdict::Mismatch { diffs, .. } => {
                assert_eq!(diffs.len(), 2);
                assert_eq!(diffs[0].to_string(), "size: expected 10, got 0");
                assert_eq!(diffs[1].to_string(), "mode: expected 420, got nothing");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_hardlinks_pair_by_path() {
        let a = truth(258, ObjectKind::File, "/a", ParentRef::Root);
        let b = truth(258, ObjectKind::File, "/b", ParentRef::Root);
        // reported in the other order
        let verdicts = compare(
            &[a.clone(), b.clone()],
            &[parsed_from(&b), parsed_from(&a)],
            &ComparisonPolicy::default(),
        );
        assert!(verdicts.iter().all(Verdict::is_match), "{verdicts:?}");
    }

    #[test]
    fn test_path_fallback_compares_parent_by_inode() {
        let dir = truth(257, ObjectKind::SubvolumeRoot, "/sub", ParentRef::Root);
        let file = truth(258, ObjectKind::File, "/sub/f", ParentRef::Object(ObjectKey::new(256, 257)));

        // no volumes, subvolume reported as a directory
        let mut parsed_dir = parsed_from(&dir);
        parsed_dir.key = Some(ObjectKey::new(0, 257));
        parsed_dir.facts.kind = Some(ObjectKind::Directory);
        let mut parsed_file = parsed_from(&file);
        parsed_file.key = Some(ObjectKey::new(0, 258));
        parsed_file.facts.parent = Some(ParentRef::Object(ObjectKey::new(0, 257)));

        let verdicts = compare(
            &[dir.clone(), file.clone()],
            &[parsed_dir.clone(), parsed_file.clone()],
            &ComparisonPolicy::default(),
        );
        assert!(verdicts.iter().all(Verdict::is_match), "{verdicts:?}");

        let strict = ComparisonPolicy {
            lenient_subvolume_kind: false,
            ..Default::default()
        };
        let verdicts = compare(&[dir, file], &[parsed_dir, parsed_file], &strict);
        assert!(!verdicts[0].is_match());
        assert!(verdicts[1].is_match());
    }

    #[test]
    fn test_directory_size_and_precision() {
        let mut dir = truth(257, ObjectKind::Directory, "/a", ParentRef::Root);
        dir.facts.mtime = Some(Timestamp::new(100, 5));
        let mut parsed = parsed_from(&dir);
        parsed.facts.size = Some(0);
        parsed.facts.mtime = Some(Timestamp::new(100, 0));

        let policy = ComparisonPolicy {
            ignore_directory_size: true,
            ..Default::default()
        };
        assert!(compare(&[dir.clone()], &[parsed.clone()], &policy)[0].is_match());

        let policy = ComparisonPolicy {
            ignore_directory_size: true,
            timestamp_precision: TimestampPrecision::Nanoseconds,
            ..Default::default()
        };
        assert!(!compare(&[dir], &[parsed], &policy)[0].is_match());
    }

    #[test]
    fn test_unexpected_and_ignored() {
        let file = truth(258, ObjectKind::File, "/f", ParentRef::Root);
        let extra = ParsedObject {
            key: Some(key(300)),
            facts: facts(ObjectKind::File, "/$Extend", ParentRef::Root),
            ..Default::default()
        };
        let broken = ParsedObject {
            parse_error: Some("corrupt node".into()),
            ..Default::default()
        };
        let parsed = [parsed_from(&file), extra, broken];

        let policy = ComparisonPolicy {
            ignore: vec![IgnoreRule::NamePrefix("$".into())],
            ..Default::default()
        };
        let result = verify(&[file.clone()], &parsed, &policy);
        assert!(!result.passed);
        assert_eq!(result.counts.unexpected, 1);
        assert_eq!(result.parse_errors, vec!["<no path>: corrupt node".to_string()]);

        let result = verify(&[file], &parsed, &ComparisonPolicy::default());
        assert_eq!(result.counts.unexpected, 2);
    }

    #[test]
    fn test_report_display() {
        let file = truth(258, ObjectKind::File, "/f", ParentRef::Root);
        let result = verify(&[file], &[], &ComparisonPolicy::default());
        assert_eq!(
            result.to_string(),
            "FAIL: 0 matched, 0 mismatched, 1 missing, 0 unexpected\n  missing /f (5:258)\n"
        );

        let json = serde_json::to_value(&result.failures[0]).unwrap();
        assert_eq!(json["verdict"], "missing");
        assert_eq!(json["object"]["path"], "/f");
    }
}
