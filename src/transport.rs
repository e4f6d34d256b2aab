//! HTTP transport capability.
//!
//! The orchestrator only ever needs "send this method, headers and body to
//! this URL and give me back status, headers and body". [`Transport`] is that
//! seam; [`HttpTransport`] fills it with a blocking reqwest client.

use std::fs;

use http::{HeaderMap, StatusCode};
use reqwest::blocking::Client;
use reqwest::redirect::Policy;
use reqwest::Certificate;
use thiserror::Error;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::request::DavRequest;
use crate::target::{ConnectionTarget, TlsPolicy};

/// A response that carried an HTTP status
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Value of a response header, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// No HTTP status could be obtained
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Failed(String),
}

/// Sends one request and blocks until the reply (or failure) is in.
pub trait Transport {
    fn send(
        &self,
        target: &ConnectionTarget,
        request: &DavRequest,
    ) -> std::result::Result<HttpReply, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn send(
        &self,
        target: &ConnectionTarget,
        request: &DavRequest,
    ) -> std::result::Result<HttpReply, TransportError> {
        (**self).send(target, request)
    }
}

/// Transport over a blocking reqwest client.
///
/// Certificate verification is relaxed only when the caller asked for it;
/// the client is built once and reused for every round trip of every call.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(options: &crate::ClientOptions) -> Result<Self> {
        // 3xx replies come back as-is; PROPFIND and REPORT must never turn into GET.
        let mut builder = Client::builder()
            .user_agent(options.user_agent.clone())
            .redirect(Policy::none())
            .danger_accept_invalid_certs(!options.verify_tls);

        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(path) = &options.ca_cert {
            let pem = fs::read(path).map_err(|source| Error::CaCertificate {
                path: path.display().to_string(),
                source,
            })?;
            builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }
}

impl Transport for HttpTransport {
    fn send(
        &self,
        target: &ConnectionTarget,
        request: &DavRequest,
    ) -> std::result::Result<HttpReply, TransportError> {
        debug!(
            method = %request.method,
            url = %request.url,
            tls = ?target.tls,
            "sending request"
        );
        if target.tls == TlsPolicy::Unverified {
            debug!("certificate verification disabled for {}", target.host);
        }

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(credentials) = &target.credentials {
            builder = builder.basic_auth(&credentials.username, credentials.password.as_ref());
        }

        // A String body carries its length, so reqwest never falls back to
        // chunked encoding and never waits on `Expect: 100-continue`.
        if let Some(body) = &request.body {
            trace!(body = %body, "request body");
            builder = builder.body(body.clone());
        }

        let response = builder.send()?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text()?;

        debug!(status = status.as_u16(), "received reply");
        trace!(body = %body, "reply body");

        Ok(HttpReply {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{build_dirlist_request, Verb};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    /// Answer exactly one request with `response`, returning what was received.
    fn serve_once(response: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/ab", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut head = String::new();
            let mut length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    length = value.trim().parse().unwrap();
                }
                head.push_str(&line);
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut body = vec![0; length];
            reader.read_exact(&mut body).unwrap();
            reader.get_mut().write_all(response.as_bytes()).unwrap();
            head
        });
        (url, handle)
    }

    #[test]
    fn test_redirect_is_not_followed() {
        let (url, server) = serve_once(
            "HTTP/1.1 301 Moved Permanently\r\nLocation: /ab/\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        let options = crate::ClientOptions {
            timeout: Some(Duration::from_secs(5)),
            ..crate::ClientOptions::default()
        };
        let transport = HttpTransport::new(&options).unwrap();
        let target = ConnectionTarget::parse(&url, &options).unwrap();
        let request = DavRequest::new(Verb::Propfind, target.url().clone()).body(build_dirlist_request());

        let reply = transport.send(&target, &request).unwrap();
        assert_eq!(reply.status, StatusCode::MOVED_PERMANENTLY);
        assert_eq!(reply.header("location"), Some("/ab/"));

        let head = server.join().unwrap();
        assert!(head.starts_with("PROPFIND /ab HTTP/1.1"));
        assert!(head.to_ascii_lowercase().contains("depth: 1"));
    }
}
