//! CardDAV verbs as sequences of transport round trips.
//!
//! Every call starts from scratch: resolve the URL, confirm the collection
//! speaks CardDAV, then run the verb. Nothing carries over between calls, so
//! concurrent writers are kept apart only by entity tags and locks on the
//! server.

use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use reqwest::Url;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, debug_span};

use crate::config::ClientOptions;
use crate::error::{ErrorDetail, Failure, NO_MATCH};
use crate::lock::{LockCoordinator, LockToken};
use crate::parser::{
    collect_hrefs, extract_address_data_blocks, extract_etag, extract_prefixed,
    extract_pseudo_header, first_resource, split_options, unescape_xml, CardRecord,
};
use crate::request::{
    build_dirlist_request, build_displayname_request, build_etag_request, build_multiget_request,
    build_uid_query_request, depth, DavRequest, Verb,
};
use crate::target::ConnectionTarget;
use crate::transport::{HttpReply, HttpTransport, Transport};
use crate::vcard::{annotate_uri, ensure_uid, resource_name, strip_uri, URI_PROPERTY};

/// How a card already on the server is located
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Addressing {
    /// Search by the card's `UID` property
    #[default]
    ByUid,
    /// Use the server reference stored in the card's `URI` property
    ByUri,
}

/// Time window for range-scoped retrieval. Carried but not yet used to filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl TimeRange {
    /// Both ends in CardDAV UTC form, `YYYYMMDDTHHMMSSZ`.
    pub fn to_carddav(&self) -> (String, String) {
        let render = |t: OffsetDateTime| {
            t.to_offset(time::UtcOffset::UTC)
                .format(format_description!("[year][month][day]T[hour][minute][second]Z"))
                .unwrap_or_default()
        };
        (render(self.start), render(self.end))
    }
}

/// One public verb with its inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Add { card: String },
    Delete { card: String, addressing: Addressing },
    Modify { card: String, addressing: Addressing },
    Get { range: Option<TimeRange> },
    GetAll { addressing: Addressing },
    GetDisplayName,
    EnabledProbe,
    ListOptions,
}

/// What a successful call hands back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A mutation was confirmed by the server
    Done,
    /// Concatenated card text
    Cards(String),
    DisplayName(String),
    Enabled(bool),
    Options(Vec<String>),
}

/// A resource found by discovery
#[derive(Debug, Clone)]
struct Located {
    url: Url,
    etag: String,
}

/// CardDAV client. Owns its transport and options; holds no per-call state.
pub struct CardDavClient<T: Transport = HttpTransport> {
    transport: T,
    options: ClientOptions,
    username: Option<String>,
    password: Option<String>,
}

impl CardDavClient<HttpTransport> {
    /// Client over HTTP with the given options.
    pub fn new(options: ClientOptions) -> crate::error::Result<Self> {
        let transport = HttpTransport::new(&options)?;
        Ok(Self::with_transport(transport, options))
    }
}

impl<T: Transport> CardDavClient<T> {
    pub fn with_transport(transport: T, options: ClientOptions) -> Self {
        Self {
            transport,
            options,
            username: None,
            password: None,
        }
    }

    /// Credentials used when a URL carries none of its own.
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run one operation against the collection at `url`.
    pub fn execute(&self, url: &str, operation: &Operation) -> Result<Payload, Failure> {
        match operation {
            Operation::Add { card } => self.add(card, url).map(|()| Payload::Done),
            Operation::Delete { card, addressing } => {
                self.delete_with(card, url, *addressing).map(|()| Payload::Done)
            }
            Operation::Modify { card, addressing } => {
                self.modify_with(card, url, *addressing).map(|()| Payload::Done)
            }
            Operation::Get { range } => self.get(*range, url).map(Payload::Cards),
            Operation::GetAll { addressing } => {
                self.get_all_with(url, *addressing).map(Payload::Cards)
            }
            Operation::GetDisplayName => self.display_name(url).map(Payload::DisplayName),
            Operation::EnabledProbe => Ok(Payload::Enabled(self.enabled_resource(url))),
            Operation::ListOptions => self.server_options(url).map(Payload::Options),
        }
    }

    // -------------------------------------------------------------------------
    // Public verbs
    // -------------------------------------------------------------------------

    /// Store a new card in the collection.
    ///
    /// A missing `UID` is generated; the resource name derives from it and
    /// an existing resource of that name is never overwritten.
    pub fn add(&self, card: &str, url: &str) -> Result<(), Failure> {
        let _span = debug_span!("add").entered();
        let target = self.prepare(url)?;

        let (card, uid) = ensure_uid(card);
        let resource = target
            .member_url(&resource_name(&uid))
            .map_err(|e| ErrorDetail::validation(e.to_string()))?;

        let request = DavRequest::new(Verb::Put, resource)
            .if_none_match_any()
            .body(card);
        let reply = self.send(&target, &request)?;
        require_status(&reply, |status| status.is_success())
    }

    pub fn delete(&self, card: &str, url: &str) -> Result<(), Failure> {
        self.delete_with(card, url, Addressing::ByUid)
    }

    pub fn delete_by_uri(&self, card: &str, url: &str) -> Result<(), Failure> {
        self.delete_with(card, url, Addressing::ByUri)
    }

    pub fn modify(&self, card: &str, url: &str) -> Result<(), Failure> {
        self.modify_with(card, url, Addressing::ByUid)
    }

    pub fn modify_by_uri(&self, card: &str, url: &str) -> Result<(), Failure> {
        self.modify_with(card, url, Addressing::ByUri)
    }

    /// Cards in a time range. The range is reserved: every card is returned.
    pub fn get(&self, range: Option<TimeRange>, url: &str) -> Result<String, Failure> {
        let _span = debug_span!("get").entered();
        if let Some(range) = range {
            let (start, end) = range.to_carddav();
            debug!(%start, %end, "time range requested; returning the full collection");
        }
        let target = self.prepare(url)?;
        self.fetch_all(&target, Addressing::ByUid).map(concat_cards)
    }

    pub fn get_all(&self, url: &str) -> Result<String, Failure> {
        self.get_all_with(url, Addressing::ByUid)
    }

    /// Every card, each annotated with its `URI` on the server.
    pub fn get_all_by_uri(&self, url: &str) -> Result<String, Failure> {
        self.get_all_with(url, Addressing::ByUri)
    }

    /// Every card as structured records, in server order.
    pub fn cards(&self, url: &str) -> Result<Vec<CardRecord>, Failure> {
        let _span = debug_span!("cards").entered();
        let target = self.prepare(url)?;
        self.fetch_all(&target, Addressing::ByUid)
    }

    pub fn display_name(&self, url: &str) -> Result<String, Failure> {
        let _span = debug_span!("display_name").entered();
        let target = self.prepare(url)?;

        let request = DavRequest::new(Verb::Propfind, target.url().clone())
            .header(depth(), HeaderValue::from_static("0"))
            .body(build_displayname_request());
        let reply = self.send(&target, &request)?;
        require_status(&reply, |status| status == StatusCode::MULTI_STATUS)?;

        extract_prefixed("displayname", &reply.body)
            .map(|name| unescape_xml(name.trim()).into_owned())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ErrorDetail::new(NO_MATCH, "No display name found").into())
    }

    /// Whether the collection advertises CardDAV. Any failure is `false`.
    pub fn enabled_resource(&self, url: &str) -> bool {
        let _span = debug_span!("enabled_resource").entered();
        match self.resolve(url) {
            Ok(target) => match self.probe_carddav(&target) {
                Ok(()) => true,
                Err(failure) => {
                    debug!(%failure, "not a CardDAV resource");
                    false
                }
            },
            Err(_) => false,
        }
    }

    /// Methods the server allows on the collection, in the order given.
    pub fn server_options(&self, url: &str) -> Result<Vec<String>, Failure> {
        let _span = debug_span!("server_options").entered();
        let target = self.resolve(url)?;
        let reply = self.send(&target, &DavRequest::new(Verb::Options, target.url().clone()))?;
        require_status(&reply, |status| status.is_success())?;

        Ok(reply
            .headers
            .get_all(http::header::ALLOW)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(split_options)
            .collect())
    }

    // -------------------------------------------------------------------------
    // Verb bodies
    // -------------------------------------------------------------------------

    fn delete_with(&self, card: &str, url: &str, addressing: Addressing) -> Result<(), Failure> {
        let _span = debug_span!("delete", ?addressing).entered();
        let target = self.prepare(url)?;
        let located = self.locate(&target, card, addressing)?;

        let request = DavRequest::new(Verb::Delete, located.url).if_match(&located.etag)?;
        self.locked_write(&target, request, |status| status.is_success())
    }

    fn modify_with(&self, card: &str, url: &str, addressing: Addressing) -> Result<(), Failure> {
        let _span = debug_span!("modify", ?addressing).entered();
        let target = self.prepare(url)?;
        let located = self.locate(&target, card, addressing)?;

        let request = DavRequest::new(Verb::Put, located.url)
            .if_match(&located.etag)?
            .body(strip_uri(card));
        self.locked_write(&target, request, |status| status == StatusCode::NO_CONTENT)
    }

    fn get_all_with(&self, url: &str, addressing: Addressing) -> Result<String, Failure> {
        let _span = debug_span!("get_all", ?addressing).entered();
        let target = self.prepare(url)?;
        self.fetch_all(&target, addressing).map(concat_cards)
    }

    // -------------------------------------------------------------------------
    // Steps
    // -------------------------------------------------------------------------

    fn resolve(&self, url: &str) -> Result<ConnectionTarget, Failure> {
        ConnectionTarget::parse(url, &self.options)
            .map(|target| {
                target.with_default_credentials(self.username.as_deref(), self.password.as_deref())
            })
            .map_err(|e| ErrorDetail::validation(e.to_string()).into())
    }

    /// Common preamble: resolve the URL and confirm CardDAV support.
    fn prepare(&self, url: &str) -> Result<ConnectionTarget, Failure> {
        let target = self.resolve(url)?;
        self.probe_carddav(&target)?;
        Ok(target)
    }

    /// OPTIONS on the collection; CardDAV iff `DAV` mentions `addressbook`.
    fn probe_carddav(&self, target: &ConnectionTarget) -> Result<(), Failure> {
        let reply = self.send(target, &DavRequest::new(Verb::Options, target.url().clone()))?;
        require_status(&reply, |status| status.is_success())?;

        let enabled = reply
            .headers
            .get_all("dav")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains("addressbook"));
        if enabled {
            Ok(())
        } else {
            Err(ErrorDetail::new(NO_MATCH, "resource is not CardDAV enabled").into())
        }
    }

    fn send(&self, target: &ConnectionTarget, request: &DavRequest) -> Result<HttpReply, Failure> {
        self.transport.send(target, request).map_err(Failure::from)
    }

    /// Find the resource a card refers to, with its current entity tag.
    fn locate(
        &self,
        target: &ConnectionTarget,
        card: &str,
        addressing: Addressing,
    ) -> Result<Located, Failure> {
        match addressing {
            Addressing::ByUid => {
                let uid = extract_pseudo_header("UID", card, true)
                    .ok_or_else(|| ErrorDetail::validation("Missing required UID for object"))?;

                let request = DavRequest::new(Verb::Report, target.url().clone())
                    .body(build_uid_query_request(&uid));
                let reply = self.send(target, &request)?;
                require_status(&reply, |status| status == StatusCode::MULTI_STATUS)?;

                // Gone since the caller last saw it: a synchronization race.
                let (href, etag) = first_resource(&reply.body).ok_or_else(ErrorDetail::no_object_found)?;
                let url = target
                    .resource_url(&href)
                    .map_err(|_| ErrorDetail::no_object_found())?;
                debug!(%uid, %url, %etag, "located card");
                Ok(Located { url, etag })
            }
            Addressing::ByUri => {
                let uri = extract_pseudo_header(URI_PROPERTY, card, true).ok_or_else(|| {
                    ErrorDetail::validation(
                        "Missing required URI for object\nThe requested contact may not exist on the server",
                    )
                })?;
                let url = target
                    .resource_url(&uri)
                    .map_err(|e| ErrorDetail::validation(e.to_string()))?;

                let request = DavRequest::new(Verb::Propfind, url.clone())
                    .header(depth(), HeaderValue::from_static("0"))
                    .body(build_etag_request());
                let reply = self.send(target, &request)?;
                if reply.status == StatusCode::NOT_FOUND {
                    return Err(ErrorDetail::no_object_found().into());
                }
                require_status(&reply, |status| status == StatusCode::MULTI_STATUS)?;

                let etag = extract_etag(&reply.body).ok_or_else(ErrorDetail::no_object_found)?;
                debug!(%url, %etag, "located card");
                Ok(Located { url, etag })
            }
        }
    }

    /// Issue a prepared conditional write, under a lock when the server
    /// offers one.
    ///
    /// A held lock (423) aborts before any write; an unimplemented LOCK (501)
    /// carries on unlocked. The lock is released whatever the write's fate.
    fn locked_write(
        &self,
        target: &ConnectionTarget,
        request: DavRequest,
        accept: impl Fn(StatusCode) -> bool,
    ) -> Result<(), Failure> {
        let mut locks = LockCoordinator::new(&self.transport, target);
        let guard = if self.options.use_locking && locks.probe_support() {
            Some(locks.lock(&request.url)?)
        } else {
            None
        };

        let token = guard
            .as_ref()
            .and_then(|guard| guard.token())
            .filter(|token| !token.is_placeholder());
        let request = with_lock(request, token)?;
        let sent = self.send(target, &request);

        if let Some(guard) = guard {
            guard.release();
        }

        let reply = sent?;
        require_status(&reply, accept)
    }

    /// Directory listing followed by one multiget for every reference.
    fn fetch_all(
        &self,
        target: &ConnectionTarget,
        addressing: Addressing,
    ) -> Result<Vec<CardRecord>, Failure> {
        let listing = DavRequest::new(Verb::Propfind, target.url().clone()).body(build_dirlist_request());
        let reply = self.send(target, &listing)?;
        require_status(&reply, |status| status == StatusCode::MULTI_STATUS)?;

        let hrefs = collect_hrefs(&reply.body);
        debug!(count = hrefs.len(), "listed collection");
        if hrefs.is_empty() {
            return Ok(Vec::new());
        }

        let multiget = DavRequest::new(Verb::Report, target.url().clone())
            .body(build_multiget_request(&hrefs));
        let reply = self.send(target, &multiget)?;
        require_status(&reply, |status| status == StatusCode::MULTI_STATUS)?;

        let records = extract_address_data_blocks(&reply.body).map(|mut record| {
            if addressing == Addressing::ByUri {
                record.data = annotate_uri(&record.data, &record.href);
            }
            record
        });
        Ok(records.collect())
    }
}

fn require_status(reply: &HttpReply, accept: impl Fn(StatusCode) -> bool) -> Result<(), Failure> {
    if accept(reply.status) {
        Ok(())
    } else {
        Err(ErrorDetail::from_reply(reply).into())
    }
}

fn with_lock(request: DavRequest, token: Option<&LockToken>) -> Result<DavRequest, ErrorDetail> {
    match token {
        Some(token) => request.try_header(HeaderName::from_static("if"), &token.if_header()),
        None => Ok(request),
    }
}

fn concat_cards(records: Vec<CardRecord>) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(&record.data);
        if !record.data.ends_with('\n') {
            out.push_str("\r\n");
        }
    }
    out
}
