use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Site metadata from the `<siteinfo>` element of a dump.
///
/// The namespace table is keyed by the numeric namespace id and kept ordered;
/// it is immutable once the header has been parsed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Siteinfo {
    pub sitename: String,
    pub dbname: String,
    pub base: String,
    pub generator: String,
    pub namespaces: BTreeMap<i32, String>,
}

impl Siteinfo {
    pub fn namespace_name(&self, key: i32) -> Option<&str> {
        self.namespaces.get(&key).map(|s| s.as_str())
    }
}

/// Dump-wide metadata, parsed exactly once per dump.
///
/// Every [`Page`] produced in a run holds an `Arc` to the same `Header`
/// instance; it is never deep-copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub lang: String,
    pub version: String,
    pub siteinfo: Siteinfo,
}

impl Header {
    pub fn new(lang: String, version: String, siteinfo: Siteinfo) -> Self {
        Self {
            lang,
            version,
            siteinfo,
        }
    }
}

/// One page record extracted from a dump, read-only downstream.
///
/// `revision` is the revision `<timestamp>` as milliseconds since the epoch;
/// `0` when the dump carried no parseable timestamp.
#[derive(Debug, Clone)]
pub struct Page {
    pub header: Arc<Header>,
    pub id: i64,
    pub title: String,
    pub content: String,
    pub revision: i64,
    pub namespace: i32,
    pub format: String,
}

/// Flat projection of a [`Page`] for line-oriented serialized output.
#[derive(Serialize)]
pub struct PageRecord<'a> {
    pub id: i64,
    pub title: &'a str,
    pub ns: i32,
    pub revision: i64,
    pub format: &'a str,
    pub text: &'a str,
}

impl<'a> From<&'a Page> for PageRecord<'a> {
    fn from(page: &'a Page) -> Self {
        Self {
            id: page.id,
            title: &page.title,
            ns: page.namespace,
            revision: page.revision,
            format: &page.format,
            text: &page.content,
        }
    }
}
