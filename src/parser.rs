//! Tag-scoped text scanning over multistatus bodies.
//!
//! Servers disagree on namespace prefixes (`href`, `D:href`, `d:href`,
//! `ns0:href`) and occasionally send bodies a strict XML parser rejects, so
//! extraction works on element boundaries in plain text. Absence of a tag is
//! always `None`; deciding whether that is fatal is up to the caller.

use std::borrow::Cow;
use std::ops::Range;

use quick_xml::escape::{escape, unescape};

/// Prefix spellings tried, in order, by [`extract_prefixed`].
pub const NAMESPACE_PREFIXES: [&str; 3] = ["", "D:", "d:"];

/// Per-entry fields recovered from a multiget or query reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardRecord {
    pub href: String,
    pub etag: String,
    pub uid: Option<String>,
    pub data: String,
}

/// Location of one element in a body.
#[derive(Debug, Clone)]
struct Element {
    /// Byte range of the content between the opening and closing tags
    content: Range<usize>,
    /// Byte offset just past the closing tag (or the self-closing opener)
    end: usize,
}

/// Content between the first `<tag ...>` and its `</tag>`.
///
/// `tag` is matched literally, prefix included. A self-closing `<tag/>`
/// yields an empty string.
pub fn extract_tag<'a>(tag: &str, text: &'a str) -> Option<&'a str> {
    find_element(text, 0, |name| name == tag).map(|el| &text[el.content])
}

/// [`extract_tag`] tolerant of namespace prefixes.
///
/// Tries the bare name, then `D:`, then `d:`, and finally any other prefix,
/// returning the first match.
pub fn extract_prefixed<'a>(local: &str, text: &'a str) -> Option<&'a str> {
    NAMESPACE_PREFIXES
        .iter()
        .find_map(|prefix| extract_tag(&format!("{}{}", prefix, local), text))
        .or_else(|| find_element(text, 0, |name| local_name(name) == local).map(|el| &text[el.content]))
}

pub fn extract_href(text: &str) -> Option<String> {
    extract_prefixed("href", text)
        .map(|href| unescape_xml(href.trim()).into_owned())
        .filter(|href| !href.is_empty())
}

/// Entity tag with its surrounding quotes removed.
///
/// Weak tags (`W/"..."`) are returned untouched since they cannot be
/// re-quoted for `If-Match`.
pub fn extract_etag(text: &str) -> Option<String> {
    let raw = extract_prefixed("getetag", text)?;
    let etag = unescape_xml(raw.trim());
    let etag = etag.trim();
    if etag.starts_with("W/") {
        return Some(etag.to_string());
    }
    let etag = etag.trim_matches('"');
    if etag.is_empty() {
        None
    } else {
        Some(etag.to_string())
    }
}

/// Quote an entity tag for use in `If-Match`.
pub fn quote_etag(etag: &str) -> String {
    if etag.starts_with("W/") || etag.starts_with('"') {
        etag.to_string()
    } else {
        format!("\"{}\"", etag)
    }
}

/// Value of a `NAME:value` property line in a card body.
///
/// Parameters (`UID;VALUE=text:...`) and folded continuation lines are
/// handled. With `case_insensitive` the property name is compared ignoring
/// ASCII case, which is what vCard mandates.
pub fn extract_pseudo_header(name: &str, text: &str, case_insensitive: bool) -> Option<String> {
    let mut lines = text.lines().map(|l| l.trim_end_matches('\r')).peekable();
    while let Some(line) = lines.next() {
        // Continuation lines belong to the property above; they never name one.
        if line.starts_with([' ', '\t']) {
            continue;
        }
        let Some((property, value)) = line.split_once(':') else {
            continue;
        };
        let property = property.split(';').next().unwrap_or("").trim();
        let matches = if case_insensitive {
            property.eq_ignore_ascii_case(name)
        } else {
            property == name
        };
        if !matches {
            continue;
        }

        let mut value = value.to_string();
        while let Some(next) = lines.peek() {
            match next.strip_prefix(' ').or_else(|| next.strip_prefix('\t')) {
                Some(rest) => {
                    value.push_str(rest);
                    lines.next();
                }
                None => break,
            }
        }

        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

/// Every href in document order, whatever prefix spells it.
///
/// The scan resumes right after each match until the body is exhausted.
pub fn collect_hrefs(text: &str) -> Vec<String> {
    let mut hrefs = Vec::new();
    let mut pos = 0;
    while let Some(el) = find_element(text, pos, |name| local_name(name) == "href") {
        let href = unescape_xml(text[el.content.clone()].trim());
        if !href.is_empty() {
            hrefs.push(href.into_owned());
        }
        pos = el.end;
    }
    hrefs
}

/// First `response` entry carrying both an href and an entity tag.
pub fn first_resource(text: &str) -> Option<(String, String)> {
    let mut pos = 0;
    while let Some(el) = find_element(text, pos, |name| local_name(name) == "response") {
        let block = &text[el.content.clone()];
        if let (Some(href), Some(etag)) = (extract_href(block), extract_etag(block)) {
            return Some((href, etag));
        }
        pos = el.end;
    }
    // Some servers omit the response wrapper entirely.
    Some((extract_href(text)?, extract_etag(text)?))
}

/// Card entries of a multistatus body, in document order.
///
/// The iterator is cheap to clone, so the sequence can be restarted.
pub fn extract_address_data_blocks(text: &str) -> AddressDataBlocks<'_> {
    AddressDataBlocks { text, pos: 0 }
}

#[derive(Debug, Clone)]
pub struct AddressDataBlocks<'a> {
    text: &'a str,
    pos: usize,
}

impl Iterator for AddressDataBlocks<'_> {
    type Item = CardRecord;

    fn next(&mut self) -> Option<CardRecord> {
        while let Some(el) = find_element(self.text, self.pos, |name| local_name(name) == "response") {
            self.pos = el.end;
            let block = &self.text[el.content];
            if let Some(record) = card_record(block) {
                return Some(record);
            }
        }
        self.pos = self.text.len();
        None
    }
}

fn card_record(block: &str) -> Option<CardRecord> {
    let data = find_element(block, 0, |name| local_name(name) == "address-data")?;
    let href = extract_href(block)?;
    let etag = extract_etag(block)?;

    let raw = block[data.content].trim();
    let data = match raw.strip_prefix("<![CDATA[").and_then(|r| r.strip_suffix("]]>")) {
        Some(cdata) => cdata.to_string(),
        None => unescape_xml(raw).into_owned(),
    };
    let data = vcard_span(&data).to_string();
    let uid = extract_pseudo_header("UID", &data, true);

    Some(CardRecord {
        href,
        etag,
        uid,
        data,
    })
}

/// Trim card text to the `BEGIN:VCARD` ... `END:VCARD` span, if present.
fn vcard_span(data: &str) -> &str {
    let upper = data.to_ascii_uppercase();
    let Some(start) = upper.find("BEGIN:VCARD") else {
        return data.trim();
    };
    match upper.rfind("END:VCARD") {
        Some(end) if end >= start => &data[start..end + "END:VCARD".len()],
        _ => data[start..].trim_end(),
    }
}

/// Split a comma separated header value into trimmed, non-empty tokens.
pub fn split_options(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Replace the predefined XML entities and numeric character references.
///
/// Unknown or malformed references are kept as literal text rather than
/// failing the whole value.
pub fn unescape_xml(text: &str) -> Cow<'_, str> {
    match unescape(text) {
        Ok(decoded) => decoded,
        Err(_) => Cow::Owned(unescape_lenient(text)),
    }
}

/// Decode reference by reference, leaving the ones quick-xml rejects as-is.
fn unescape_lenient(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail
            .find(';')
            .filter(|&semi| semi <= 10)
            .and_then(|semi| unescape(&tail[..=semi]).ok().map(|c| (c, semi)));
        match decoded {
            Some((c, semi)) => {
                out.push_str(&c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Escape the characters that are significant in XML text content.
pub fn escape_xml(text: &str) -> Cow<'_, str> {
    escape(text)
}

fn local_name(qualified: &str) -> &str {
    qualified.rsplit(':').next().unwrap_or(qualified)
}

/// Locate the first element at or after `from` whose qualified name
/// satisfies `wanted`.
fn find_element(text: &str, from: usize, wanted: impl Fn(&str) -> bool) -> Option<Element> {
    let mut search = from;
    while let Some(offset) = text.get(search..)?.find('<') {
        let open = search + offset;
        let name_start = open + 1;
        let name_len = text[name_start..]
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(text.len() - name_start);
        let name = &text[name_start..name_start + name_len];
        search = name_start;

        if name.is_empty() || name.starts_with(['/', '?', '!']) || !wanted(name) {
            continue;
        }

        let Some(gt) = text[name_start + name_len..].find('>') else {
            return None;
        };
        let open_end = name_start + name_len + gt + 1;
        if text[..open_end - 1].ends_with('/') {
            return Some(Element {
                content: open_end..open_end,
                end: open_end,
            });
        }

        let closing = format!("</{}", name);
        let mut probe = open_end;
        while let Some(rel) = text[probe..].find(&closing) {
            let close = probe + rel;
            let after = close + closing.len();
            match text[after..].chars().next() {
                Some('>') => {
                    return Some(Element {
                        content: open_end..close,
                        end: after + 1,
                    })
                }
                Some(c) if c.is_whitespace() => {
                    let gt = text[after..].find('>').map(|g| after + g + 1).unwrap_or(text.len());
                    return Some(Element {
                        content: open_end..close,
                        end: gt,
                    });
                }
                _ => probe = after,
            }
        }
        // Unterminated element: not a match.
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTISTATUS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:carddav">
  <D:response>
    <D:href>/ab/me/one.vcf</D:href>
    <D:propstat>
      <D:prop>
        <D:getetag>"etag-1"</D:getetag>
        <C:address-data>BEGIN:VCARD
VERSION:3.0
UID:uid-1
FN:Ada &amp; Co
END:VCARD
</C:address-data>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/ab/me/two.vcf</D:href>
    <D:propstat>
      <D:prop>
        <D:getetag>&quot;etag-2&quot;</D:getetag>
        <C:address-data><![CDATA[BEGIN:VCARD
VERSION:3.0
UID:uid-2
FN:Grace <Hopper>
END:VCARD]]></C:address-data>
      </D:prop>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/ab/me/three.vcf</D:href>
    <D:propstat>
      <D:prop>
        <D:getetag>"etag-3"</D:getetag>
        <C:address-data>BEGIN:VCARD
UID:uid-3
END:VCARD</C:address-data>
      </D:prop>
    </D:propstat>
  </D:response>
</D:multistatus>"#;

    #[test]
    fn test_extract_tag_ignores_attributes() {
        let body = r#"<displayname xml:lang="en">Contacts</displayname>"#;
        assert_eq!(extract_tag("displayname", body), Some("Contacts"));
    }

    #[test]
    fn test_extract_tag_requires_exact_name() {
        let body = "<hrefs>no</hrefs><href>yes</href>";
        assert_eq!(extract_tag("href", body), Some("yes"));
        assert_eq!(extract_tag("href", "<D:href>x</D:href>"), None);
    }

    #[test]
    fn test_extract_tag_self_closing() {
        assert_eq!(extract_tag("getetag", "<getetag/>"), Some(""));
    }

    #[test]
    fn test_extract_tag_missing_is_none() {
        assert_eq!(extract_tag("href", "<multistatus/>"), None);
        assert_eq!(extract_tag("href", "<href>unterminated"), None);
    }

    #[test]
    fn test_href_prefix_tolerance() {
        let plain = "<multistatus><response><href>/a/b.vcf</href></response></multistatus>";
        let upper = "<D:multistatus><D:response><D:href>/a/b.vcf</D:href></D:response></D:multistatus>";
        let lower = "<d:multistatus><d:response><d:href>/a/b.vcf</d:href></d:response></d:multistatus>";
        let expected = Some("/a/b.vcf".to_string());
        assert_eq!(extract_href(plain), expected);
        assert_eq!(extract_href(upper), expected);
        assert_eq!(extract_href(lower), expected);
    }

    #[test]
    fn test_prefix_order_prefers_bare_name() {
        let body = "<D:href>second</D:href><href>first</href>";
        assert_eq!(extract_prefixed("href", body), Some("first"));
    }

    #[test]
    fn test_other_prefixes_are_last_resort() {
        let body = "<ns0:href>/x.vcf</ns0:href>";
        assert_eq!(extract_href(body), Some("/x.vcf".to_string()));
    }

    #[test]
    fn test_etag_strips_quotes() {
        assert_eq!(extract_etag("<getetag>\"abc\"</getetag>"), Some("abc".to_string()));
        assert_eq!(extract_etag("<D:getetag>&quot;abc&quot;</D:getetag>"), Some("abc".to_string()));
        assert_eq!(extract_etag("<getetag>W/\"weak\"</getetag>"), Some("W/\"weak\"".to_string()));
        assert_eq!(extract_etag("<getetag>\"\"</getetag>"), None);
    }

    #[test]
    fn test_quote_etag() {
        assert_eq!(quote_etag("abc"), "\"abc\"");
        assert_eq!(quote_etag("W/\"abc\""), "W/\"abc\"");
    }

    #[test]
    fn test_pseudo_header() {
        let card = "BEGIN:VCARD\r\nVERSION:3.0\r\nuid:abc-123 \r\nURI:/ab/me/x.vcf\r\nEND:VCARD\r\n";
        assert_eq!(extract_pseudo_header("UID", card, true), Some("abc-123".to_string()));
        assert_eq!(extract_pseudo_header("UID", card, false), None);
        assert_eq!(extract_pseudo_header("URI", card, false), Some("/ab/me/x.vcf".to_string()));
        assert_eq!(extract_pseudo_header("NOTE", card, true), None);
    }

    #[test]
    fn test_pseudo_header_params_and_folding() {
        let card = "BEGIN:VCARD\nUID;VALUE=text:urn:uuid:1234\n 5678\nEND:VCARD";
        assert_eq!(
            extract_pseudo_header("UID", card, true),
            Some("urn:uuid:12345678".to_string())
        );
    }

    #[test]
    fn test_address_data_blocks_in_order() {
        let records: Vec<_> = extract_address_data_blocks(MULTISTATUS).collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].href, "/ab/me/one.vcf");
        assert_eq!(records[0].etag, "etag-1");
        assert_eq!(records[0].uid.as_deref(), Some("uid-1"));
        assert!(records[0].data.contains("FN:Ada & Co"));
        assert!(records[0].data.ends_with("END:VCARD"));
        assert_eq!(records[1].etag, "etag-2");
        assert!(records[1].data.contains("FN:Grace <Hopper>"));
        assert_eq!(records[2].uid.as_deref(), Some("uid-3"));
    }

    #[test]
    fn test_address_data_blocks_restartable() {
        let blocks = extract_address_data_blocks(MULTISTATUS);
        let first: Vec<_> = blocks.clone().map(|r| r.href).collect();
        let second: Vec<_> = blocks.map(|r| r.href).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_address_data_blocks_empty() {
        let body = r#"<D:multistatus xmlns:D="DAV:"><D:response><D:href>/ab/</D:href>
<D:propstat><D:status>HTTP/1.1 404 Not Found</D:status></D:propstat></D:response></D:multistatus>"#;
        assert_eq!(extract_address_data_blocks(body).count(), 0);
        assert_eq!(extract_address_data_blocks("").count(), 0);
    }

    #[test]
    fn test_collect_hrefs_mixed_prefixes() {
        let body = r#"<multistatus>
<response><href>/ab/</href></response>
<D:response><D:href>/ab/1.vcf</D:href></D:response>
<d:response><d:href>/ab/2.vcf</d:href></d:response>
<response><href>/ab/a&amp;b.vcf</href></response>
</multistatus>"#;
        assert_eq!(
            collect_hrefs(body),
            vec!["/ab/", "/ab/1.vcf", "/ab/2.vcf", "/ab/a&b.vcf"]
        );
    }

    #[test]
    fn test_first_resource() {
        assert_eq!(
            first_resource(MULTISTATUS),
            Some(("/ab/me/one.vcf".to_string(), "etag-1".to_string()))
        );
        assert_eq!(first_resource("<D:multistatus xmlns:D=\"DAV:\"/>"), None);
    }

    #[test]
    fn test_split_options() {
        assert_eq!(
            split_options("OPTIONS, GET, PUT,DELETE , ,REPORT"),
            vec!["OPTIONS", "GET", "PUT", "DELETE", "REPORT"]
        );
        assert!(split_options("").is_empty());
    }

    #[test]
    fn test_escape_roundtrip_characters() {
        assert_eq!(escape_xml("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
        assert_eq!(unescape_xml("&#65;&#x42;&unknown; &"), "AB&unknown; &");
        assert_eq!(unescape_xml("Tom &amp; Jerry&#13;&#10;"), "Tom & Jerry\r\n");
        assert!(matches!(unescape_xml("plain"), Cow::Borrowed("plain")));
    }

    #[test]
    fn test_pseudo_header_ignores_folded_lines() {
        let card = "BEGIN:VCARD\r\nNOTE:see below\r\n UID:wrong\r\nUID:right\r\nEND:VCARD\r\n";
        assert_eq!(extract_pseudo_header("UID", card, true), Some("right".to_string()));
        assert_eq!(
            extract_pseudo_header("NOTE", card, true),
            Some("see belowUID:wrong".to_string())
        );
    }
}
