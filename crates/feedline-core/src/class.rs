use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::feedtype::{Feedtype, FeedtypeDb};
use crate::product::ProductInfo;
use crate::signature::Signature;
use crate::time::Timestamp;

/// Pattern text that matches every identifier.
pub const MATCH_ALL: &str = ".*";
/// Prefix of the pseudo-spec that carries a resume signature.
pub const RESUME_TOKEN_PREFIX: &str = "SIG=";

/// Errors returned while building product classes.
#[derive(Debug, Error)]
pub enum ClassError {
    /// The pattern is not a valid regular expression.
    #[error("invalid pattern {pattern:?}: {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Clone)]
enum Compiled {
    All,
    Regex(Regex),
    /// Source that failed to compile; matches nothing.
    Invalid(String),
}

/// Compiled identifier pattern that keeps its source text.
///
/// Equality, hashing and serialization use the source text only. Decoding
/// never fails on a bad expression: the pattern is kept as invalid so the
/// receiving side can answer with a precise refusal.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    compiled: Compiled,
}

impl Pattern {
    pub fn new(source: impl Into<String>) -> Result<Self, ClassError> {
        let source = source.into();
        if source == MATCH_ALL {
            return Ok(Self::any());
        }
        let regex = Regex::new(&source).map_err(|err| ClassError::BadPattern {
            pattern: source.clone(),
            source: err,
        })?;
        Ok(Self {
            source,
            compiled: Compiled::Regex(regex),
        })
    }

    /// Like [`Pattern::new`] but keeps an uncompilable source as an invalid
    /// pattern instead of failing.
    pub fn lenient(source: impl Into<String>) -> Self {
        let source = source.into();
        match Self::new(source.clone()) {
            Ok(pattern) => pattern,
            Err(err) => Self {
                source,
                compiled: Compiled::Invalid(err.to_string()),
            },
        }
    }

    /// Pattern that matches everything.
    pub fn any() -> Self {
        Self {
            source: MATCH_ALL.to_string(),
            compiled: Compiled::All,
        }
    }

    /// Literal text that is never compiled, such as a resume token.
    fn opaque(source: String) -> Self {
        Self {
            source,
            compiled: Compiled::All,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self.compiled, Compiled::Invalid(_))
    }

    /// Compiler message for an invalid pattern.
    pub fn compile_error(&self) -> Option<&str> {
        match &self.compiled {
            Compiled::Invalid(message) => Some(message),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self.compiled, Compiled::All)
    }

    pub fn is_match(&self, ident: &str) -> bool {
        match &self.compiled {
            Compiled::All => true,
            Compiled::Regex(regex) => regex.is_match(ident),
            Compiled::Invalid(_) => false,
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({:?})", self.source)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

impl Hash for Pattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

impl TryFrom<String> for Pattern {
    type Error = ClassError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Pattern::new(value)
    }
}

impl From<Pattern> for String {
    fn from(value: Pattern) -> Self {
        value.source
    }
}

impl Serialize for Pattern {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let source = String::deserialize(deserializer)?;
        Ok(Pattern::lenient(source))
    }
}

/// One (feedtype, pattern) selection criterion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductSpec {
    pub feedtype: Feedtype,
    pub pattern: Pattern,
}

impl ProductSpec {
    pub fn new(feedtype: Feedtype, pattern: &str) -> Result<Self, ClassError> {
        Ok(Self {
            feedtype,
            pattern: Pattern::new(pattern)?,
        })
    }

    pub fn any(feedtype: Feedtype) -> Self {
        Self {
            feedtype,
            pattern: Pattern::any(),
        }
    }

    /// Bitmask match, enough for tables without value feedtypes.
    pub fn matches(&self, info: &ProductInfo) -> bool {
        self.feedtype.overlaps(info.feedtype) && self.pattern.is_match(&info.ident)
    }

    /// Match through the algebra of `db`. Feedtypes `db` does not know
    /// never match.
    pub fn matches_in(&self, db: &FeedtypeDb, info: &ProductInfo) -> bool {
        db.matches(self.feedtype, info.feedtype).unwrap_or(false)
            && self.pattern.is_match(&info.ident)
    }
}

impl fmt::Display for ProductSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, \"{}\"}}", self.feedtype, self.pattern)
    }
}

/// Ordered product specifications plus a half-open time window `[from, to)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductClass {
    pub from: Timestamp,
    pub to: Timestamp,
    pub specs: Vec<ProductSpec>,
}

impl ProductClass {
    pub fn new(from: Timestamp, to: Timestamp, specs: Vec<ProductSpec>) -> Self {
        Self { from, to, specs }
    }

    /// Every product, any time.
    pub fn everything() -> Self {
        Self::new(
            Timestamp::ZERO,
            Timestamp::END,
            vec![ProductSpec::any(Feedtype::ANY)],
        )
    }

    /// Same time window, no specs.
    pub fn emptied(&self) -> Self {
        Self::new(self.from, self.to, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn contains_time(&self, time: Timestamp) -> bool {
        self.from <= time && (time < self.to || self.to == Timestamp::END)
    }

    /// Whether the product arrived inside the window and matches any spec.
    pub fn matches(&self, info: &ProductInfo) -> bool {
        self.contains_time(info.arrival) && self.specs.iter().any(|spec| spec.matches(info))
    }

    /// Like [`matches`](Self::matches), with feedtypes resolved by `db`.
    pub fn matches_in(&self, db: &FeedtypeDb, info: &ProductInfo) -> bool {
        self.contains_time(info.arrival) && self.specs.iter().any(|spec| spec.matches_in(db, info))
    }

    /// Drops specs whose feedtype is `NONE`.
    pub fn scrunch(&mut self) {
        self.specs.retain(|spec| !spec.feedtype.is_none());
    }

    /// Compares the spec lists, ignoring the time window.
    pub fn same_specs(&self, other: &ProductClass) -> bool {
        self.specs == other.specs
    }

    /// First spec whose pattern failed to compile.
    pub fn invalid_pattern(&self) -> Option<&Pattern> {
        self.specs
            .iter()
            .map(|spec| &spec.pattern)
            .find(|pattern| !pattern.is_valid())
    }

    /// OR of every spec's feedtype.
    pub fn feedtype(&self) -> Feedtype {
        self.specs
            .iter()
            .fold(Feedtype::NONE, |acc, spec| acc | spec.feedtype)
    }

    /// Copy of this class with a trailing resume-signature pseudo-spec.
    pub fn with_resume_token(&self, signature: &Signature) -> Self {
        let mut out = self.clone();
        out.specs.push(ProductSpec {
            feedtype: Feedtype::NONE,
            pattern: Pattern::opaque(format!("{RESUME_TOKEN_PREFIX}{signature}")),
        });
        out
    }

    /// Removes a trailing resume-signature pseudo-spec and returns its
    /// signature. A malformed token is removed and ignored.
    pub fn take_resume_token(&mut self) -> Option<Signature> {
        let last = self.specs.last()?;
        if !last.feedtype.is_none() {
            return None;
        }
        let hex = last.pattern.as_str().strip_prefix(RESUME_TOKEN_PREFIX)?;
        let signature = hex.parse::<Signature>().ok();
        self.specs.pop();
        signature
    }

    /// Moves `from` forward so that it is no older than `max_latency`.
    pub fn vet_from(&mut self, now: Timestamp, max_latency: Duration) {
        let earliest = now.saturating_sub(max_latency);
        if self.from < earliest {
            self.from = earliest;
        }
    }
}

impl fmt::Display for ProductClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {{", self.from, self.to)?;
        for (index, spec) in self.specs.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{spec}")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Pattern, ProductClass, ProductSpec};
    use crate::feedtype::{Feedtype, FeedtypeDb};
    use crate::product::Product;
    use crate::signature::Signature;
    use crate::time::Timestamp;

    fn product(ft: u32, ident: &str, arrival_secs: i64) -> Product {
        Product::new(
            Feedtype(ft),
            ident,
            "origin",
            0,
            Timestamp::from_secs(arrival_secs),
            ident.as_bytes().to_vec(),
        )
    }

    #[test]
    fn class_matches_on_window_feedtype_and_pattern() {
        let class = ProductClass::new(
            Timestamp::from_secs(10),
            Timestamp::from_secs(20),
            vec![ProductSpec::new(Feedtype(4), "^SA").expect("pattern")],
        );
        assert!(class.matches(&product(4, "SAUS43", 15).info));
        assert!(!class.matches(&product(4, "FTUS43", 15).info));
        assert!(!class.matches(&product(8, "SAUS43", 15).info));
        assert!(!class.matches(&product(4, "SAUS43", 20).info));
        assert!(!class.matches(&product(4, "SAUS43", 9).info));
    }

    #[test]
    fn value_feedtypes_match_through_the_table() {
        let mut db = FeedtypeDb::new();
        db.add_leaf("L1", 0x100).expect("L1");
        db.add_leaf("L2", 0x200).expect("L2");
        db.add_value("L12", 0x1000, &["L1", "L2"], &[]).expect("L12");
        let class = ProductClass::new(
            Timestamp::ZERO,
            Timestamp::END,
            vec![ProductSpec::any(Feedtype(0x1000))],
        );
        let l1 = product(0x100, "A", 5).info;
        assert!(!class.matches(&l1));
        assert!(class.matches_in(&db, &l1));
        assert!(!class.matches_in(&db, &product(0x4000, "A", 5).info));
    }

    #[test]
    fn bad_pattern_is_reported() {
        let err = Pattern::new("(unclosed").expect_err("invalid regex");
        assert!(err.to_string().contains("(unclosed"));
    }

    #[test]
    fn decoded_bad_pattern_is_kept_as_invalid() {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer("(unclosed", &mut bytes).expect("encode");
        let pattern: Pattern = ciborium::de::from_reader(bytes.as_slice()).expect("decode");
        assert!(!pattern.is_valid());
        assert!(pattern.compile_error().is_some());
        assert!(!pattern.is_match("(unclosed"));

        let class = ProductClass::new(
            Timestamp::ZERO,
            Timestamp::END,
            vec![ProductSpec::any(Feedtype(1)), ProductSpec { feedtype: Feedtype(2), pattern }],
        );
        assert_eq!(class.invalid_pattern().map(Pattern::as_str), Some("(unclosed"));
    }

    #[test]
    fn resume_token_round_trips_through_class() {
        let class = ProductClass::everything();
        let sig = Signature::of(b"last");
        let mut with_token = class.with_resume_token(&sig);
        assert_eq!(with_token.specs.len(), 2);
        assert_eq!(with_token.take_resume_token(), Some(sig));
        assert_eq!(with_token, class);
        assert_eq!(with_token.take_resume_token(), None);
    }

    #[test]
    fn scrunch_drops_none_specs() {
        let mut class = ProductClass::new(
            Timestamp::ZERO,
            Timestamp::END,
            vec![
                ProductSpec::any(Feedtype::NONE),
                ProductSpec::any(Feedtype(2)),
                ProductSpec::any(Feedtype::NONE),
            ],
        );
        class.scrunch();
        assert_eq!(class.specs, vec![ProductSpec::any(Feedtype(2))]);
        assert_eq!(class.feedtype(), Feedtype(2));
    }

    #[test]
    fn vet_from_only_moves_forward() {
        let now = Timestamp::from_secs(10_000);
        let mut class = ProductClass::everything();
        class.vet_from(now, Duration::from_secs(3_600));
        assert_eq!(class.from, Timestamp::from_secs(6_400));

        class.from = Timestamp::from_secs(9_000);
        class.vet_from(now, Duration::from_secs(3_600));
        assert_eq!(class.from, Timestamp::from_secs(9_000));
    }

    #[test]
    fn display_lists_specs() {
        let class = ProductClass::new(
            Timestamp::ZERO,
            Timestamp::END,
            vec![
                ProductSpec::new(Feedtype(4), "foo").expect("pattern"),
                ProductSpec::new(Feedtype(0b1011), "bar").expect("pattern"),
            ],
        );
        assert_eq!(
            class.to_string(),
            "TS_ZERO TS_ENDT {{HDS, \"foo\"},{DDPLUS|IDS, \"bar\"}}"
        );
    }
}
