//! Client side of the CardDAV address book protocol.
//!
//! Each public verb on [`CardDavClient`] is a short, self-contained sequence
//! of HTTP round trips against one collection URL. Outcomes collapse into
//! [`CardDavResponse`]; failures carry an [`ErrorDetail`] with the code and
//! message that caused them.

pub mod client;
pub mod config;
pub mod error;
pub mod lock;
pub mod parser;
pub mod request;
pub mod target;
pub mod transport;
pub mod vcard;

pub use client::{Addressing, CardDavClient, Operation, Payload, TimeRange};
pub use config::ClientOptions;
pub use error::{CardDavResponse, ErrorDetail, Failure};
pub use parser::CardRecord;
pub use request::{DavRequest, Verb};
pub use target::{ConnectionTarget, Credentials, TlsPolicy};
pub use transport::{HttpReply, HttpTransport, Transport, TransportError};
