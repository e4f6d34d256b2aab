//! Literal request bodies and per-verb header sets.

use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, IF_MATCH, IF_NONE_MATCH};
use std::sync::LazyLock;

use http::Method;
use reqwest::Url;

use crate::error::{ErrorDetail, VALIDATION_FAILURE};
use crate::parser::escape_xml;

const XML_CONTENT_TYPE: &str = "application/xml; charset=\"utf-8\"";
const VCARD_CONTENT_TYPE: &str = "text/vcard; charset=utf-8";

/// Seconds a LOCK is requested for.
pub const LOCK_TIMEOUT: &str = "Second-300";

const DIRLIST_REQUEST: &str = concat!(
    "<?xml version=\"1.0\" encoding=\"utf-8\" ?>",
    "<a:propfind xmlns:a=\"DAV:\">",
    "  <a:prop><a:resourcetype/></a:prop>",
    "</a:propfind>\r\n"
);

const DISPLAYNAME_REQUEST: &str = concat!(
    "<?xml version=\"1.0\" encoding=\"utf-8\" ?>",
    "<D:propfind xmlns:D=\"DAV:\">",
    "  <D:prop><D:displayname/></D:prop>",
    "</D:propfind>\r\n"
);

const ETAG_REQUEST: &str = concat!(
    "<?xml version=\"1.0\" encoding=\"utf-8\" ?>",
    "<D:propfind xmlns:D=\"DAV:\">",
    "  <D:prop><D:getetag/></D:prop>",
    "</D:propfind>\r\n"
);

const MULTIGET_HEAD: &str = concat!(
    "<?xml version=\"1.0\" encoding=\"utf-8\" ?>",
    "<C:addressbook-multiget xmlns:D=\"DAV:\"",
    " xmlns:C=\"urn:ietf:params:xml:ns:carddav\">",
    " <D:prop>",
    "   <D:getetag/>",
    "   <C:address-data>",
    "      <C:allprop/>",
    "   </C:address-data>",
    " </D:prop>"
);

const MULTIGET_TAIL: &str = "</C:addressbook-multiget>\r\n";

const QUERY_HEAD: &str = concat!(
    "<?xml version=\"1.0\" encoding=\"utf-8\" ?>",
    "<C:addressbook-query xmlns:D=\"DAV:\"",
    " xmlns:C=\"urn:ietf:params:xml:ns:carddav\">",
    " <D:prop>",
    "   <D:getetag/>",
    "   <C:address-data>",
    "      <C:allprop/>",
    "   </C:address-data>",
    " </D:prop>",
    " <C:filter test=\"anyof\">",
    "    <C:prop-filter name=\"UID\">"
);

const QUERY_TAIL: &str = concat!(
    "    </C:prop-filter>",
    " </C:filter>",
    "</C:addressbook-query>\r\n"
);

const LOCK_REQUEST: &str = concat!(
    "<?xml version=\"1.0\" encoding=\"utf-8\" ?>",
    "<D:lockinfo xmlns:D=\"DAV:\">",
    "  <D:lockscope><D:exclusive/></D:lockscope>",
    "  <D:locktype><D:write/></D:locktype>",
    "  <D:owner><D:href>carddav</D:href></D:owner>",
    "</D:lockinfo>\r\n"
);

static PROPFIND: LazyLock<Method> = LazyLock::new(|| extension_method(b"PROPFIND"));
static REPORT: LazyLock<Method> = LazyLock::new(|| extension_method(b"REPORT"));
static LOCK: LazyLock<Method> = LazyLock::new(|| extension_method(b"LOCK"));
static UNLOCK: LazyLock<Method> = LazyLock::new(|| extension_method(b"UNLOCK"));

fn extension_method(name: &'static [u8]) -> Method {
    Method::from_bytes(name).expect("WebDAV method names are valid tokens")
}

/// Protocol verbs the orchestrator issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Options,
    Propfind,
    Report,
    Put,
    Delete,
    Lock,
    Unlock,
}

impl Verb {
    pub fn method(&self) -> Method {
        match self {
            Verb::Options => Method::OPTIONS,
            Verb::Put => Method::PUT,
            Verb::Delete => Method::DELETE,
            Verb::Propfind => PROPFIND.clone(),
            Verb::Report => REPORT.clone(),
            Verb::Lock => LOCK.clone(),
            Verb::Unlock => UNLOCK.clone(),
        }
    }

    fn carries_xml(&self) -> bool {
        matches!(self, Verb::Propfind | Verb::Report | Verb::Lock)
    }
}

/// One fully assembled request
#[derive(Debug, Clone)]
pub struct DavRequest {
    pub verb: Verb,
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

impl DavRequest {
    pub fn new(verb: Verb, url: Url) -> Self {
        Self {
            verb,
            method: verb.method(),
            url,
            headers: required_headers(verb),
            body: None,
        }
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Add a header built from runtime text.
    ///
    /// Text that cannot travel as a header value refuses the whole request,
    /// so a precondition is never silently lost.
    pub fn try_header(self, name: HeaderName, value: &str) -> Result<Self, ErrorDetail> {
        match HeaderValue::from_str(value) {
            Ok(value) => Ok(self.header(name, value)),
            Err(_) => Err(ErrorDetail::new(
                VALIDATION_FAILURE,
                format!("`{}` is not a valid {} header value", value, name),
            )),
        }
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Conditional on the current entity tag.
    pub fn if_match(self, etag: &str) -> Result<Self, ErrorDetail> {
        self.try_header(IF_MATCH, &crate::parser::quote_etag(etag))
    }

    /// Refuse to overwrite an existing resource.
    pub fn if_none_match_any(self) -> Self {
        self.header(IF_NONE_MATCH, HeaderValue::from_static("*"))
    }
}

/// Header set every request of `verb` carries.
///
/// XML bodies get their content type, PROPFIND/REPORT get `Depth: 1` and all
/// requests ask for the connection to be closed. Bodies are always sent with
/// a known length, which keeps chunked encoding and `Expect` negotiation off
/// the wire for servers that reject them.
pub fn required_headers(verb: Verb) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if verb.carries_xml() {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(XML_CONTENT_TYPE));
    }
    if verb == Verb::Put {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(VCARD_CONTENT_TYPE));
    }
    match verb {
        Verb::Propfind | Verb::Report => {
            headers.insert(depth(), HeaderValue::from_static("1"));
        }
        Verb::Lock => {
            headers.insert(depth(), HeaderValue::from_static("0"));
            headers.insert(HeaderName::from_static("timeout"), HeaderValue::from_static(LOCK_TIMEOUT));
        }
        _ => {}
    }
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    headers
}

pub fn depth() -> HeaderName {
    HeaderName::from_static("depth")
}

/// PROPFIND body listing the children of a collection.
pub fn build_dirlist_request() -> &'static str {
    DIRLIST_REQUEST
}

/// PROPFIND body asking for a collection's display name.
pub fn build_displayname_request() -> &'static str {
    DISPLAYNAME_REQUEST
}

/// PROPFIND body asking for a single resource's entity tag.
pub fn build_etag_request() -> &'static str {
    ETAG_REQUEST
}

/// addressbook-multiget REPORT for exactly `hrefs`, in order, duplicates kept.
pub fn build_multiget_request<S: AsRef<str>>(hrefs: &[S]) -> String {
    let mut body = String::from(MULTIGET_HEAD);
    for href in hrefs {
        body.push_str(" <D:href>");
        body.push_str(&escape_xml(href.as_ref()));
        body.push_str("</D:href>\r\n");
    }
    body.push_str(MULTIGET_TAIL);
    body
}

/// addressbook-query REPORT matching `uid` exactly, case-normalised.
pub fn build_uid_query_request(uid: &str) -> String {
    format!(
        "{}<C:text-match collation=\"i;unicode-casemap\" negate-condition=\"no\" match-type=\"equals\">{}</C:text-match>{}",
        QUERY_HEAD,
        escape_xml(uid),
        QUERY_TAIL
    )
}

/// LOCK body requesting an exclusive write lock.
pub fn build_lock_request() -> &'static str {
    LOCK_REQUEST
}
