//! Resolution of a caller-supplied collection URL.

use percent_encoding::percent_decode_str;
use reqwest::Url;

use crate::config::ClientOptions;
use crate::error::{Error, Result};

/// How the connection is secured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Plain `http`
    Plain,
    /// `https` with certificate verification
    Verified,
    /// `https` accepting any certificate
    Unverified,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Where one call talks to. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub credentials: Option<Credentials>,
    pub tls: TlsPolicy,
    /// The collection URL with any userinfo removed
    url: Url,
}

impl ConnectionTarget {
    /// Parse `[scheme://][user[:password]@]host[:port]/path`.
    ///
    /// A missing scheme means `http`.
    pub fn parse(raw: &str, options: &ClientOptions) -> Result<Self> {
        let raw = raw.trim();
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        let invalid = |reason: String| Error::InvalidUrl {
            url: raw.to_string(),
            reason,
        };

        let mut url = Url::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;

        let scheme = url.scheme().to_ascii_lowercase();
        let tls = match scheme.as_str() {
            "http" => TlsPolicy::Plain,
            "https" if options.verify_tls => TlsPolicy::Verified,
            "https" => TlsPolicy::Unverified,
            other => return Err(invalid(format!("unsupported scheme `{}`", other))),
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?
            .to_string();

        let credentials = if url.username().is_empty() {
            None
        } else {
            Some(Credentials {
                username: decode_userinfo(url.username()),
                password: url.password().map(decode_userinfo),
            })
        };

        // Credentials travel as an Authorization header, never in the URL.
        let _ = url.set_username("");
        let _ = url.set_password(None);

        Ok(Self {
            scheme,
            host,
            port: url.port(),
            path: url.path().to_string(),
            credentials,
            tls,
            url,
        })
    }

    /// Fill in credentials from configuration when the URL carried none.
    pub fn with_default_credentials(mut self, username: Option<&str>, password: Option<&str>) -> Self {
        if self.credentials.is_none() {
            if let Some(username) = username {
                self.credentials = Some(Credentials {
                    username: username.to_string(),
                    password: password.map(str::to_string),
                });
            }
        }
        self
    }

    /// The collection URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `scheme://host[:port]`
    pub fn origin(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}", self.scheme, self.host, port),
            None => format!("{}://{}", self.scheme, self.host),
        }
    }

    /// Absolute URL of a resource from a server-assigned href.
    ///
    /// Absolute hrefs are taken as-is; paths resolve against this target.
    pub fn resource_url(&self, href: &str) -> Result<Url> {
        self.url.join(href.trim()).map_err(|e| Error::InvalidUrl {
            url: href.to_string(),
            reason: e.to_string(),
        })
    }

    /// URL of a new member of the collection.
    pub fn member_url(&self, name: &str) -> Result<Url> {
        let mut base = self.url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(name).map_err(|e| Error::InvalidUrl {
            url: name.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Userinfo arrives percent-encoded (`me%40example.com`); Basic auth wants it raw.
fn decode_userinfo(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}
