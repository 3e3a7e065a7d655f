use crate::models::{Header, Page, Siteinfo};
use anyhow::{bail, Context, Result};
use chrono::DateTime;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::collections::{BTreeMap, VecDeque};
use std::io::BufRead;
use std::sync::Arc;
use tracing::debug;

/// Streaming parser over a MediaWiki XML dump or dump fragment.
///
/// The parser is a small state machine driven by incremental XML events and
/// never materializes the document. It makes no assumption of a single
/// well-formed root element: multistream fragments start mid-document and the
/// final fragment carries a `</mediawiki>` close tag that was never opened in
/// that fragment. The reader is configured to tolerate unmatched close tags,
/// so end of input is always ordinary end-of-stream.
pub struct DumpParser<R: BufRead> {
    reader: Reader<R>,
    header: Arc<Header>,
    state: ParseState,
    draft: PageDraft,
    ready: VecDeque<Page>,
    buf: Vec<u8>,
    text_buf: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    SeekPage,
    InPage,
    InRevision,
}

struct PageDraft {
    id: i64,
    title: String,
    content: String,
    revision: i64,
    namespace: i32,
    format: String,
}

impl PageDraft {
    fn new() -> Self {
        Self {
            id: -1,
            title: String::new(),
            content: String::new(),
            revision: 0,
            namespace: 0,
            format: String::new(),
        }
    }

    fn take(&mut self, header: &Arc<Header>) -> Page {
        let page = Page {
            header: header.clone(),
            id: self.id,
            title: std::mem::take(&mut self.title),
            content: std::mem::take(&mut self.content),
            revision: self.revision,
            namespace: self.namespace,
            format: std::mem::take(&mut self.format),
        };
        self.id = -1;
        self.revision = 0;
        self.namespace = 0;
        page
    }
}

fn fragment_reader<R: BufRead>(input: R) -> Reader<R> {
    let mut reader = Reader::from_reader(input);
    reader
        .check_end_names(false)
        .expand_empty_elements(true)
        .trim_text(false);
    reader
}

impl<R: BufRead> DumpParser<R> {
    /// Parser for a complete dump; decodes the header inline from the
    /// document start before any page is returned.
    pub fn new(input: R) -> Result<Self> {
        let mut reader = fragment_reader(input);
        let header = Arc::new(read_header(&mut reader)?);
        Ok(Self::from_reader(header, reader))
    }

    /// Parser for a dump fragment with a previously decoded shared header.
    pub fn with_header(header: Arc<Header>, input: R) -> Self {
        Self::from_reader(header, fragment_reader(input))
    }

    fn from_reader(header: Arc<Header>, reader: Reader<R>) -> Self {
        Self {
            reader,
            header,
            state: ParseState::SeekPage,
            draft: PageDraft::new(),
            ready: VecDeque::new(),
            buf: Vec::new(),
            text_buf: Vec::new(),
        }
    }

    pub fn header(&self) -> &Arc<Header> {
        &self.header
    }

    pub fn get_ref(&self) -> &R {
        self.reader.get_ref()
    }

    /// Returns the next completed page, or `None` at end of input.
    ///
    /// A single close event can complete a page while more input remains;
    /// extra completed pages are queued internally and drained one per call.
    pub fn next_page(&mut self) -> Result<Option<Page>> {
        if let Some(page) = self.ready.pop_front() {
            return Ok(Some(page));
        }

        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(e @ quick_xml::Error::Io(_)) => {
                    return Err(anyhow::Error::new(e).context("reading dump stream"))
                }
                Err(e) => {
                    // Desynchronized input: skip to the next tag and resume.
                    debug!(error = %e, "skipping malformed xml event");
                    continue;
                }
            };

            match event {
                Event::Start(e) => {
                    let name = e.local_name();
                    match (self.state, name.as_ref()) {
                        (ParseState::SeekPage, b"page") => self.state = ParseState::InPage,
                        (ParseState::InPage, b"title") => {
                            self.draft.title = leaf_text(&mut self.reader, &mut self.text_buf)?
                        }
                        (ParseState::InPage, b"ns") => {
                            let text = leaf_text(&mut self.reader, &mut self.text_buf)?;
                            self.draft.namespace = parse_field(&text, "ns").unwrap_or_default();
                        }
                        (ParseState::InPage, b"id") => {
                            let text = leaf_text(&mut self.reader, &mut self.text_buf)?;
                            self.draft.id = parse_field(&text, "id").unwrap_or(-1);
                        }
                        (ParseState::InPage, b"revision") => self.state = ParseState::InRevision,
                        (ParseState::InRevision, b"timestamp") => {
                            let text = leaf_text(&mut self.reader, &mut self.text_buf)?;
                            self.draft.revision = parse_timestamp(&text);
                        }
                        (ParseState::InRevision, b"text") => {
                            self.draft.content = leaf_text(&mut self.reader, &mut self.text_buf)?
                        }
                        (ParseState::InRevision, b"model") => {
                            // Model is parsed and discarded; only format is carried.
                            leaf_text(&mut self.reader, &mut self.text_buf)?;
                        }
                        (ParseState::InRevision, b"format") => {
                            self.draft.format = leaf_text(&mut self.reader, &mut self.text_buf)?
                        }
                        _ => {}
                    }
                }
                Event::End(e) => match (self.state, e.local_name().as_ref()) {
                    // Defensive: a missing </revision> still completes the page.
                    (ParseState::InPage | ParseState::InRevision, b"page") => {
                        self.ready.push_back(self.draft.take(&self.header));
                        self.state = ParseState::SeekPage;
                    }
                    (ParseState::InRevision, b"revision") => self.state = ParseState::InPage,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }

            if !self.ready.is_empty() {
                break;
            }
        }

        Ok(self.ready.pop_front())
    }
}

/// Text content of the element whose start tag was just consumed.
/// Malformed content is non-fatal; the field falls back to empty.
fn leaf_text<R: BufRead>(reader: &mut Reader<R>, buf: &mut Vec<u8>) -> Result<String> {
    match element_text(reader, buf) {
        Ok(text) => Ok(text),
        Err(e @ quick_xml::Error::Io(_)) => {
            Err(anyhow::Error::new(e).context("reading element text"))
        }
        Err(e) => {
            debug!(error = %e, "malformed element text, using default");
            Ok(String::new())
        }
    }
}

/// Reads accumulated text until the current element's end tag.
fn element_text<R: BufRead>(
    reader: &mut Reader<R>,
    buf: &mut Vec<u8>,
) -> quick_xml::Result<String> {
    let mut out = String::new();
    loop {
        buf.clear();
        match reader.read_event_into(buf)? {
            Event::Text(t) => match t.unescape() {
                Ok(text) => out.push_str(&text),
                Err(_) => out.push_str(&String::from_utf8_lossy(&t)),
            },
            Event::End(_) => break,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

fn parse_field<T: std::str::FromStr>(text: &str, field: &str) -> Option<T> {
    match text.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            debug!(field, text, "unparseable numeric field, using default");
            None
        }
    }
}

/// Revision timestamp as epoch milliseconds; `0` when unparseable.
fn parse_timestamp(text: &str) -> i64 {
    match DateTime::parse_from_rfc3339(text.trim()) {
        Ok(ts) => ts.timestamp_millis(),
        Err(e) => {
            debug!(error = %e, text, "unparseable revision timestamp");
            0
        }
    }
}

/// Parses the dump header: the `<mediawiki>` root attributes and the
/// `<siteinfo>` block. Consumes events through `</siteinfo>`.
pub fn read_header<R: BufRead>(reader: &mut Reader<R>) -> Result<Header> {
    let mut lang = None;
    let mut version = None;
    let mut siteinfo = Siteinfo::default();
    let mut buf = Vec::new();
    let mut text_buf = Vec::new();

    loop {
        buf.clear();
        match reader
            .read_event_into(&mut buf)
            .context("reading dump header")?
        {
            Event::Start(e) => match e.local_name().as_ref() {
                b"mediawiki" => {
                    for attr in e.attributes() {
                        let attr = attr.context("reading mediawiki attributes")?;
                        match attr.key.as_ref() {
                            b"lang" => lang = Some(attr.unescape_value()?.into_owned()),
                            b"version" => version = Some(attr.unescape_value()?.into_owned()),
                            _ => {}
                        }
                    }
                }
                b"siteinfo" => {
                    read_siteinfo(reader, &mut siteinfo, &mut buf, &mut text_buf)?;
                    break;
                }
                b"page" => bail!("unexpected <page> element before <siteinfo>"),
                _ => {}
            },
            Event::Eof => bail!("end of input before <siteinfo> was found"),
            _ => {}
        }
    }

    match (lang, version) {
        (Some(lang), Some(version)) => Ok(Header::new(lang, version, siteinfo)),
        _ => bail!("dump header is missing the lang or version attribute"),
    }
}

fn read_siteinfo<R: BufRead>(
    reader: &mut Reader<R>,
    siteinfo: &mut Siteinfo,
    buf: &mut Vec<u8>,
    text_buf: &mut Vec<u8>,
) -> Result<()> {
    loop {
        buf.clear();
        match reader.read_event_into(buf).context("reading siteinfo")? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"sitename" => siteinfo.sitename = element_text(reader, text_buf)?,
                b"dbname" => siteinfo.dbname = element_text(reader, text_buf)?,
                b"base" => siteinfo.base = element_text(reader, text_buf)?,
                b"generator" => siteinfo.generator = element_text(reader, text_buf)?,
                b"namespaces" => {
                    siteinfo.namespaces = read_namespaces(reader, text_buf)?;
                }
                _ => {}
            },
            Event::End(e) if e.local_name().as_ref() == b"siteinfo" => return Ok(()),
            Event::Eof => bail!("end of input inside <siteinfo>"),
            _ => {}
        }
    }
}

fn read_namespaces<R: BufRead>(
    reader: &mut Reader<R>,
    text_buf: &mut Vec<u8>,
) -> Result<BTreeMap<i32, String>> {
    let mut namespaces = BTreeMap::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).context("reading namespaces")? {
            Event::Start(e) if e.local_name().as_ref() == b"namespace" => {
                let mut key = None;
                for attr in e.attributes() {
                    let attr = attr.context("reading namespace attributes")?;
                    if attr.key.as_ref() == b"key" {
                        key = attr.unescape_value()?.trim().parse::<i32>().ok();
                    }
                }
                let name = element_text(reader, text_buf)?;
                match key {
                    Some(key) => {
                        namespaces.insert(key, name);
                    }
                    None => debug!(name, "namespace without a numeric key, skipping"),
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"namespaces" => break,
            Event::Eof => bail!("end of input inside <namespaces>"),
            _ => {}
        }
    }

    Ok(namespaces)
}

/// Parses a header from a standalone XML string, as decoded from the first
/// block of a multistream dump.
pub fn parse_header(xml: &str) -> Result<Header> {
    let mut reader = fragment_reader(xml.as_bytes());
    read_header(&mut reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<mediawiki lang="en" version="0.10">
  <siteinfo>
    <sitename>Wikipedia</sitename>
    <dbname>enwiki</dbname>
    <base>https://en.wikipedia.org/wiki/Main_Page</base>
    <generator>MediaWiki 1.43</generator>
    <namespaces>
      <namespace key="-1">Special</namespace>
      <namespace key="0" />
      <namespace key="14">Category</namespace>
    </namespaces>
  </siteinfo>
  <page>
    <title>Alpha</title>
    <ns>0</ns>
    <id>1</id>
    <revision>
      <id>100</id>
      <timestamp>2024-01-15T10:30:00Z</timestamp>
      <model>wikitext</model>
      <format>text/x-wiki</format>
      <text>Alpha body with &amp; entity.</text>
    </revision>
  </page>
  <page>
    <title>Beta</title>
    <ns>14</ns>
    <id>2</id>
    <revision>
      <timestamp>2024-02-01T00:00:00Z</timestamp>
      <text>Beta body.</text>
    </revision>
  </page>
</mediawiki>"#;

    fn parse_all(parser: &mut DumpParser<&[u8]>) -> Vec<Page> {
        let mut pages = Vec::new();
        while let Some(page) = parser.next_page().unwrap() {
            pages.push(page);
        }
        pages
    }

    #[test]
    fn parses_header_and_pages() {
        let mut parser = DumpParser::new(SAMPLE.as_bytes()).unwrap();

        let header = parser.header().clone();
        assert_eq!(header.lang, "en");
        assert_eq!(header.version, "0.10");
        assert_eq!(header.siteinfo.sitename, "Wikipedia");
        assert_eq!(header.siteinfo.dbname, "enwiki");
        assert_eq!(header.siteinfo.namespace_name(14), Some("Category"));
        assert_eq!(header.siteinfo.namespace_name(0), Some(""));
        assert_eq!(header.siteinfo.namespaces.len(), 3);

        let pages = parse_all(&mut parser);
        assert_eq!(pages.len(), 2);

        assert_eq!(pages[0].id, 1);
        assert_eq!(pages[0].title, "Alpha");
        assert_eq!(pages[0].namespace, 0);
        assert_eq!(pages[0].format, "text/x-wiki");
        assert_eq!(pages[0].content, "Alpha body with & entity.");
        assert_eq!(pages[0].revision, 1705314600000);

        assert_eq!(pages[1].id, 2);
        assert_eq!(pages[1].namespace, 14);
        assert!(Arc::ptr_eq(&pages[0].header, &pages[1].header));
    }

    #[test]
    fn fragment_without_root_element() {
        let header = Arc::new(Header::new(
            "en".to_string(),
            "0.10".to_string(),
            Siteinfo::default(),
        ));
        let fragment = "<page><title>Solo</title><ns>0</ns><id>7</id>\
                        <revision><text>body</text></revision></page>";

        let mut parser = DumpParser::with_header(header, fragment.as_bytes());
        let page = parser.next_page().unwrap().unwrap();
        assert_eq!(page.id, 7);
        assert_eq!(page.title, "Solo");
        assert!(parser.next_page().unwrap().is_none());
    }

    #[test]
    fn trailing_unopened_close_tag_is_end_of_stream() {
        // The last multistream fragment closes a root it never opened.
        let header = Arc::new(Header::new(
            "en".to_string(),
            "0.10".to_string(),
            Siteinfo::default(),
        ));
        let fragment = "<page><title>Last</title><ns>0</ns><id>9</id>\
                        <revision><text>tail</text></revision></page>\n</mediawiki>";

        let mut parser = DumpParser::with_header(header, fragment.as_bytes());
        assert_eq!(parser.next_page().unwrap().unwrap().id, 9);
        assert!(parser.next_page().unwrap().is_none());
    }

    #[test]
    fn missing_revision_close_still_completes_page() {
        let header = Arc::new(Header::new(
            "en".to_string(),
            "0.10".to_string(),
            Siteinfo::default(),
        ));
        let fragment = "<page><title>Broken</title><id>3</id>\
                        <revision><text>cut off</text></page>";

        let mut parser = DumpParser::with_header(header, fragment.as_bytes());
        let page = parser.next_page().unwrap().unwrap();
        assert_eq!(page.id, 3);
        assert_eq!(page.content, "cut off");
        assert!(parser.next_page().unwrap().is_none());
    }

    #[test]
    fn bad_numeric_fields_are_non_fatal() {
        let header = Arc::new(Header::new(
            "en".to_string(),
            "0.10".to_string(),
            Siteinfo::default(),
        ));
        let fragment = "<page><title>Odd</title><ns>xyz</ns><id>not-a-number</id>\
                        <revision><timestamp>never</timestamp><text>kept</text>\
                        </revision></page>";

        let mut parser = DumpParser::with_header(header, fragment.as_bytes());
        let page = parser.next_page().unwrap().unwrap();
        assert_eq!(page.namespace, 0);
        assert_eq!(page.id, -1);
        assert_eq!(page.revision, 0);
        assert_eq!(page.content, "kept");
    }

    #[test]
    fn revision_id_does_not_clobber_page_id() {
        let header = Arc::new(Header::new(
            "en".to_string(),
            "0.10".to_string(),
            Siteinfo::default(),
        ));
        let fragment = "<page><title>X</title><ns>0</ns><id>5</id>\
                        <revision><id>999</id><contributor><id>123</id></contributor>\
                        <text>b</text></revision></page>";

        let mut parser = DumpParser::with_header(header, fragment.as_bytes());
        let page = parser.next_page().unwrap().unwrap();
        assert_eq!(page.id, 5);
    }

    #[test]
    fn header_missing_lang_is_fatal() {
        let xml = r#"<mediawiki version="0.10"><siteinfo></siteinfo></mediawiki>"#;
        assert!(parse_header(xml).is_err());
    }

    #[test]
    fn header_rejects_page_before_siteinfo() {
        let xml = r#"<mediawiki lang="en" version="0.10"><page></page></mediawiki>"#;
        assert!(parse_header(xml).is_err());
    }

    #[test]
    fn synthetically_closed_header_parses() {
        // Multistream header block: document start only, closed artificially.
        let mut xml = String::from(
            r#"<mediawiki lang="sv" version="0.10">
  <siteinfo>
    <sitename>Wikipedia</sitename>
    <namespaces><namespace key="0" /></namespaces>
  </siteinfo>
"#,
        );
        xml.push_str("</mediawiki>");

        let header = parse_header(&xml).unwrap();
        assert_eq!(header.lang, "sv");
        assert_eq!(header.siteinfo.sitename, "Wikipedia");
    }
}
