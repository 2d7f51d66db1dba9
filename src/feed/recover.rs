//! Best-effort extraction from XML feeds the strict parser rejects.
//!
//! The scanner walks the token stream without enforcing that end tags match
//! (the first mismatch is recorded) and stops at the first hard syntax error,
//! keeping everything collected up to that point. It also runs alongside the
//! strict parser: every item/entry element yields exactly one record, so the
//! two can be paired to recover what the strict parser normalizes away
//! (guid presence, date strings).

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::storage::Enclosure;

/// Document root recognized as a feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Rss,
    Atom,
    Rdf,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub guid: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub published: Option<String>,
    pub updated: Option<String>,
    pub categories: Vec<String>,
    pub links: Vec<String>,
    pub enclosures: Vec<Enclosure>,
}

impl RawEntry {
    fn is_empty(&self) -> bool {
        self == &RawEntry::default()
    }
}

#[derive(Debug, Default, Clone)]
pub struct RawDocument {
    pub root: Option<RootKind>,
    /// Format identifier derived from the root element (`rss20`, `atom10`, `rss10`)
    pub version: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub subtitle: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub generator: Option<String>,
    pub image: Option<String>,
    pub published: Option<String>,
    pub updated: Option<String>,
    /// One record per item/entry element, in document order
    pub entries: Vec<RawEntry>,
    /// First end tag that did not close the element it should have
    pub mismatch: Option<String>,
    /// Syntax error that stopped the scan early
    pub error: Option<String>,
}

impl RawDocument {
    /// Whether anything worth storing was recovered
    pub fn has_content(&self) -> bool {
        self.root.is_some() && (self.title.is_some() || !self.entries.is_empty())
    }

    /// First well-formedness problem found, if any
    pub fn malformation(&self) -> Option<String> {
        match (&self.mismatch, &self.error) {
            (Some(mismatch), Some(error)) => Some(format!("{}; scan stopped: {}", mismatch, error)),
            (Some(problem), None) | (None, Some(problem)) => Some(problem.clone()),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Id,
    Summary,
    Content,
    Published,
    Updated,
    Author,
    Subtitle,
    Category,
    Language,
    Generator,
    Image,
}

struct Capture {
    field: Field,
    depth: usize,
    text: String,
}

fn local_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_ascii_lowercase()
}

fn attribute(start: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

fn entry_field(name: &str) -> Option<Field> {
    match name {
        "title" => Some(Field::Title),
        "link" => Some(Field::Link),
        "guid" | "id" => Some(Field::Id),
        "description" | "summary" => Some(Field::Summary),
        "encoded" | "content" => Some(Field::Content),
        "pubdate" | "published" | "issued" | "date" => Some(Field::Published),
        "updated" | "modified" => Some(Field::Updated),
        "author" | "creator" => Some(Field::Author),
        "category" => Some(Field::Category),
        _ => None,
    }
}

fn feed_field(name: &str) -> Option<Field> {
    match name {
        "title" => Some(Field::Title),
        "link" => Some(Field::Link),
        "description" | "subtitle" | "tagline" => Some(Field::Subtitle),
        "author" | "creator" | "managingeditor" => Some(Field::Author),
        "language" => Some(Field::Language),
        "generator" => Some(Field::Generator),
        "logo" | "icon" => Some(Field::Image),
        "pubdate" | "published" | "issued" | "date" => Some(Field::Published),
        "lastbuilddate" | "updated" | "modified" => Some(Field::Updated),
        _ => None,
    }
}

/// Feed-level children whose own `<title>`/`<link>` must not leak into the feed
fn is_ignored_container(name: &str) -> bool {
    matches!(name, "image" | "textinput" | "source" | "skipdays" | "skiphours" | "cloud")
}

fn set_once(slot: &mut Option<String>, value: String) {
    if slot.is_none() && !value.is_empty() {
        *slot = Some(value);
    }
}

fn enclosure(start: &BytesStart<'_>, url_attr: &[u8]) -> Option<Enclosure> {
    let url = attribute(start, url_attr).filter(|u| !u.trim().is_empty())?;
    Some(Enclosure {
        url: url.trim().to_string(),
        media_type: attribute(start, b"type"),
        length: attribute(start, b"length").and_then(|l| l.trim().parse().ok()),
    })
}

/// Scan an XML document leniently.
pub fn scan(bytes: &[u8]) -> RawDocument {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().check_end_names = false;
    reader.config_mut().expand_empty_elements = false;

    let mut doc = RawDocument::default();
    let mut buf = Vec::new();
    let mut open: Vec<String> = Vec::new();
    let mut entry: Option<(usize, RawEntry)> = None;
    let mut capture: Option<Capture> = None;
    // Depth and name of a feed-level container being skipped
    let mut ignored: Option<(usize, String)> = None;

    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(e) => {
                doc.error = Some(format!("{} at byte {}", e, reader.error_position()));
                break;
            }
        };

        match event {
            Event::Start(ref start) | Event::Empty(ref start) => {
                let is_empty = matches!(event, Event::Empty(_));
                let name = local_name(start.local_name().as_ref());
                if !is_empty {
                    open.push(name.clone());
                }
                let depth = open.len();

                if doc.root.is_none() {
                    match name.as_str() {
                        "rss" => {
                            doc.root = Some(RootKind::Rss);
                            let version = attribute(start, b"version").unwrap_or_default();
                            doc.version = Some(format!("rss{}", version.replace('.', "")));
                        }
                        "feed" => {
                            doc.root = Some(RootKind::Atom);
                            let version = attribute(start, b"version");
                            doc.version = Some(if version.as_deref() == Some("0.3") {
                                "atom03".to_string()
                            } else {
                                "atom10".to_string()
                            });
                        }
                        "rdf" => {
                            doc.root = Some(RootKind::Rdf);
                            doc.version = Some("rss10".to_string());
                        }
                        _ => {}
                    }
                    continue;
                }

                if capture.is_some() {
                    continue;
                }

                if let Some((container_depth, container)) = &ignored {
                    // RSS carries the channel image as <image><url>
                    if container == "image" && name == "url" && depth == container_depth + 1 {
                        capture = Some(Capture {
                            field: Field::Image,
                            depth,
                            text: String::new(),
                        });
                    }
                    continue;
                }

                if name == "item" || name == "entry" {
                    // An unterminated previous entry ends where the next begins
                    if let Some((_, finished)) = entry.take() {
                        doc.entries.push(finished);
                    }
                    if is_empty {
                        doc.entries.push(RawEntry::default());
                    } else {
                        entry = Some((depth, RawEntry::default()));
                    }
                    continue;
                }

                if entry.is_none() && is_ignored_container(&name) {
                    if !is_empty {
                        ignored = Some((depth, name));
                    }
                    continue;
                }

                if let Some((_, e)) = entry.as_mut() {
                    if name == "enclosure" {
                        e.enclosures.extend(enclosure(start, b"url"));
                        continue;
                    }
                }

                let field = if entry.is_some() {
                    entry_field(&name)
                } else {
                    feed_field(&name)
                };
                let Some(field) = field else { continue };

                // Atom links carry the URL in an attribute
                if field == Field::Link {
                    if let Some(href) = attribute(start, b"href") {
                        let rel = attribute(start, b"rel");
                        let primary = rel.is_none() || rel.as_deref() == Some("alternate");
                        match entry.as_mut() {
                            Some((_, e)) => {
                                if rel.as_deref() == Some("enclosure") {
                                    e.enclosures.extend(enclosure(start, b"href"));
                                }
                                if primary {
                                    set_once(&mut e.link, href.clone());
                                }
                                e.links.push(href);
                            }
                            None if primary => set_once(&mut doc.link, href),
                            None => {}
                        }
                        continue;
                    }
                }
                // Atom categories carry the label in `term`
                if field == Field::Category {
                    if let Some(term) = attribute(start, b"term") {
                        if let Some((_, e)) = entry.as_mut() {
                            e.categories.push(term);
                        }
                        continue;
                    }
                }

                if !is_empty {
                    capture = Some(Capture {
                        field,
                        depth,
                        text: String::new(),
                    });
                }
            }
            Event::Text(text) => {
                if let Some(c) = capture.as_mut() {
                    let value = text
                        .unescape()
                        .map(|t| t.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(&text).into_owned());
                    c.text.push_str(&value);
                }
            }
            Event::CData(data) => {
                if let Some(c) = capture.as_mut() {
                    c.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::End(ref end) => {
                let depth = open.len();
                let name = local_name(end.local_name().as_ref());
                match open.pop() {
                    Some(expected) if expected != name => {
                        if doc.mismatch.is_none() {
                            doc.mismatch = Some(format!(
                                "expected </{}>, found </{}> at byte {}",
                                expected,
                                name,
                                reader.buffer_position()
                            ));
                        }
                    }
                    Some(_) => {}
                    None => {
                        if doc.mismatch.is_none() {
                            doc.mismatch = Some(format!(
                                "unexpected </{}> at byte {}",
                                name,
                                reader.buffer_position()
                            ));
                        }
                    }
                }

                if capture.as_ref().is_some_and(|c| c.depth == depth) {
                    if let Some(c) = capture.take() {
                        store_capture(&mut doc, entry.as_mut().map(|(_, e)| e), c);
                    }
                }
                if ignored.as_ref().is_some_and(|(d, _)| *d == depth) {
                    ignored = None;
                }
                if entry.as_ref().is_some_and(|(d, _)| *d == depth) {
                    if let Some((_, finished)) = entry.take() {
                        doc.entries.push(finished);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    // Keep whatever was open when the document ended
    if let Some(c) = capture.take() {
        store_capture(&mut doc, entry.as_mut().map(|(_, e)| e), c);
    }
    if let Some((_, finished)) = entry.take() {
        if !finished.is_empty() {
            doc.entries.push(finished);
        }
    }

    doc
}

fn store_capture(doc: &mut RawDocument, entry: Option<&mut RawEntry>, capture: Capture) {
    let value = capture.text.trim().to_string();
    match entry {
        Some(e) => match capture.field {
            Field::Title => set_once(&mut e.title, value),
            Field::Link => {
                if !value.is_empty() {
                    e.links.push(value.clone());
                }
                set_once(&mut e.link, value);
            }
            Field::Id => set_once(&mut e.guid, value),
            Field::Summary => set_once(&mut e.summary, value),
            Field::Content => set_once(&mut e.content, value),
            Field::Published => set_once(&mut e.published, value),
            Field::Updated => set_once(&mut e.updated, value),
            Field::Author => set_once(&mut e.author, value),
            Field::Category => {
                if !value.is_empty() {
                    e.categories.push(value);
                }
            }
            Field::Subtitle | Field::Language | Field::Generator | Field::Image => {}
        },
        None => match capture.field {
            Field::Title => set_once(&mut doc.title, value),
            Field::Link => set_once(&mut doc.link, value),
            Field::Subtitle => set_once(&mut doc.subtitle, value),
            Field::Author => set_once(&mut doc.author, value),
            Field::Language => set_once(&mut doc.language, value),
            Field::Generator => set_once(&mut doc.generator, value),
            Field::Image => set_once(&mut doc.image, value),
            Field::Published => set_once(&mut doc.published, value),
            Field::Updated => set_once(&mut doc.updated, value),
            _ => {}
        },
    }
}
