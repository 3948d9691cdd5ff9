//! Rule table: feedtype declarations followed by ordered allow, accept and
//! request entries.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use feedline_core::class::MATCH_ALL;
use feedline_core::{ClassError, Feedtype, FeedtypeDb, FeedtypeError, Pattern};
use feedline_node::acl::{AcceptRule, AccessControl, AllowRule};
use feedline_node::host::HostMatcher;
use feedline_node::requests::RequestRule;
use serde::Deserialize;
use thiserror::Error;

use crate::config::DEFAULT_PORT;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("couldn't read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("couldn't parse rule table: {0}")]
    Parse(#[from] toml::de::Error),
    /// A feedtype declaration was rejected.
    #[error(transparent)]
    Declaration(#[from] FeedtypeError),
    #[error("{kind} entry {index}: {source}")]
    Feedtype {
        kind: &'static str,
        index: usize,
        #[source]
        source: FeedtypeError,
    },
    #[error("{kind} entry {index}: {source}")]
    Pattern {
        kind: &'static str,
        index: usize,
        #[source]
        source: ClassError,
    },
    #[error("{kind} entry {index}: bad host {host:?}: {message}")]
    Host {
        kind: &'static str,
        index: usize,
        host: String,
        message: String,
    },
    #[error("request entry {index}: bad server {server:?}")]
    Server { index: usize, server: String },
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesFile {
    /// Replaces the built-in feedtype table when present.
    pub feedtypes: Option<FeedtypeDecls>,
    #[serde(default)]
    pub allow: Vec<AllowDecl>,
    #[serde(default)]
    pub accept: Vec<AcceptDecl>,
    #[serde(default)]
    pub request: Vec<RequestDecl>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedtypeDecls {
    #[serde(default)]
    pub bits: Vec<BitDecl>,
    #[serde(default)]
    pub masks: Vec<MemberDecl>,
    #[serde(default)]
    pub values: Vec<ValueDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BitDecl {
    pub name: String,
    pub bit: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemberDecl {
    pub name: String,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValueDecl {
    pub name: String,
    pub value: u32,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllowDecl {
    pub feedtype: String,
    pub host: String,
    #[serde(default = "match_all")]
    pub pattern: String,
    /// Identifiers never sent even when `pattern` matches.
    pub not: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcceptDecl {
    pub feedtype: String,
    pub host: String,
    #[serde(default = "match_all")]
    pub pattern: String,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestDecl {
    pub feedtype: String,
    #[serde(default = "match_all")]
    pub pattern: String,
    /// `host` or `host:port`.
    pub server: String,
}

fn match_all() -> String {
    MATCH_ALL.to_string()
}

/// A loaded rule table.
#[derive(Debug)]
pub struct Rules {
    pub feedtypes: Arc<FeedtypeDb>,
    pub acl: AccessControl,
}

pub fn load(path: &Path) -> Result<Rules, RulesError> {
    let text = std::fs::read_to_string(path).map_err(|source| RulesError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<Rules, RulesError> {
    let file: RulesFile = toml::from_str(text)?;
    build(file)
}

fn build(file: RulesFile) -> Result<Rules, RulesError> {
    let feedtypes = Arc::new(match &file.feedtypes {
        Some(decls) => declare(decls)?,
        None => FeedtypeDb::standard(),
    });
    let mut acl = AccessControl::with_feedtypes(Arc::clone(&feedtypes));

    for (index, decl) in file.allow.iter().enumerate() {
        let kind = "allow";
        acl.add_allow(AllowRule {
            feedtype: feedtype(&feedtypes, kind, index, &decl.feedtype)?,
            host: host(kind, index, &decl.host)?,
            ok_pattern: pattern(kind, index, &decl.pattern)?,
            not_pattern: decl
                .not
                .as_deref()
                .map(|not| pattern(kind, index, not))
                .transpose()?,
        });
    }
    for (index, decl) in file.accept.iter().enumerate() {
        let kind = "accept";
        acl.add_accept(AcceptRule {
            feedtype: feedtype(&feedtypes, kind, index, &decl.feedtype)?,
            pattern: pattern(kind, index, &decl.pattern)?,
            host: host(kind, index, &decl.host)?,
            is_primary: decl.primary,
        });
    }
    for (index, decl) in file.request.iter().enumerate() {
        let kind = "request";
        let (server, port) = split_server(&decl.server).ok_or_else(|| RulesError::Server {
            index,
            server: decl.server.clone(),
        })?;
        acl.add_request(RequestRule {
            feedtype: feedtype(&feedtypes, kind, index, &decl.feedtype)?,
            pattern: pattern(kind, index, &decl.pattern)?,
            server,
            port,
        });
    }

    Ok(Rules { feedtypes, acl })
}

fn declare(decls: &FeedtypeDecls) -> Result<FeedtypeDb, RulesError> {
    let mut db = FeedtypeDb::new();
    for bit in &decls.bits {
        db.add_bit(&bit.name, bit.bit)?;
    }
    for mask in &decls.masks {
        db.add_mask(&mask.name, &names(&mask.include), &names(&mask.exclude))?;
    }
    for value in &decls.values {
        db.add_value(
            &value.name,
            value.value,
            &names(&value.include),
            &names(&value.exclude),
        )?;
    }
    Ok(db)
}

fn names(list: &[String]) -> Vec<&str> {
    list.iter().map(String::as_str).collect()
}

fn feedtype(db: &FeedtypeDb, kind: &'static str, index: usize, expr: &str) -> Result<Feedtype, RulesError> {
    db.parse(expr)
        .map_err(|source| RulesError::Feedtype { kind, index, source })
}

fn pattern(kind: &'static str, index: usize, source: &str) -> Result<Pattern, RulesError> {
    Pattern::new(source).map_err(|source| RulesError::Pattern { kind, index, source })
}

fn host(kind: &'static str, index: usize, text: &str) -> Result<HostMatcher, RulesError> {
    HostMatcher::parse(text).map_err(|err| RulesError::Host {
        kind,
        index,
        host: text.to_string(),
        message: err.to_string(),
    })
}

/// Splits `host[:port]`, defaulting the port.
pub fn split_server(text: &str) -> Option<(String, u16)> {
    let text = text.trim();
    let (host, port) = match text.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (text, DEFAULT_PORT),
    };
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}
