//! Optional WebDAV locking around conditional writes.
//!
//! Locking is advisory: a server may not implement it at all. The coordinator
//! hides that difference so the write path is the same either way.

use http::header::{HeaderName, HeaderValue};
use reqwest::Url;
use tracing::{debug, warn};

use crate::error::{ErrorDetail, Failure};
use crate::parser::{extract_prefixed, extract_href};
use crate::request::{build_lock_request, DavRequest, Verb};
use crate::target::ConnectionTarget;
use crate::transport::Transport;

/// An opaque lock token. Empty means "locking not implemented, carry on".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(token: impl Into<String>) -> Self {
        LockToken(token.into())
    }

    /// Placeholder used when the server answered LOCK with 501.
    pub fn placeholder() -> Self {
        LockToken(String::new())
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value for the `If:` header.
    pub fn if_header(&self) -> String {
        format!("({})", self.0)
    }
}

/// What probing told us about the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockSupport {
    Unprobed,
    Unsupported,
    Supported,
}

/// Why a lock could not be obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockRefused {
    /// Someone else holds the lock (423). The write must not happen.
    Locked(ErrorDetail),
    /// Any other failure, surfaced unchanged.
    Failed(ErrorDetail),
}

impl From<LockRefused> for Failure {
    fn from(refused: LockRefused) -> Self {
        match refused {
            LockRefused::Locked(detail) | LockRefused::Failed(detail) => detail.into(),
        }
    }
}

pub struct LockCoordinator<'a, T: Transport> {
    transport: &'a T,
    target: &'a ConnectionTarget,
    support: LockSupport,
}

impl<'a, T: Transport> LockCoordinator<'a, T> {
    pub fn new(transport: &'a T, target: &'a ConnectionTarget) -> Self {
        Self {
            transport,
            target,
            support: LockSupport::Unprobed,
        }
    }

    pub fn support(&self) -> LockSupport {
        self.support
    }

    /// Ask the server whether it advertises LOCK.
    ///
    /// Never fails: anything other than a clear "yes" counts as unsupported.
    pub fn probe_support(&mut self) -> bool {
        if self.support == LockSupport::Unprobed {
            self.support = self.query_support();
        }
        self.support == LockSupport::Supported
    }

    fn query_support(&self) -> LockSupport {
        let request = DavRequest::new(Verb::Options, self.target.url().clone());
        match self.transport.send(self.target, &request) {
            Ok(reply) if reply.is_success() => {
                let advertised = reply
                    .header("allow")
                    .map(crate::parser::split_options)
                    .unwrap_or_default()
                    .iter()
                    .any(|method| method.eq_ignore_ascii_case("LOCK"));
                debug!(advertised, "lock support probed");
                if advertised {
                    LockSupport::Supported
                } else {
                    LockSupport::Unsupported
                }
            }
            Ok(reply) if reply.status.as_u16() == 501 => LockSupport::Unsupported,
            Ok(reply) => {
                debug!(status = reply.status.as_u16(), "lock probe failed, assuming no locking");
                LockSupport::Unsupported
            }
            Err(err) => {
                debug!(error = %err, "lock probe failed, assuming no locking");
                LockSupport::Unsupported
            }
        }
    }

    /// Request an exclusive write lock on `resource`.
    ///
    /// A 501 answer yields a placeholder token so callers proceed as if no
    /// lock were in play.
    pub fn acquire(&self, resource: &Url) -> Result<LockToken, LockRefused> {
        let request = DavRequest::new(Verb::Lock, resource.clone()).body(build_lock_request());
        let reply = self
            .transport
            .send(self.target, &request)
            .map_err(|err| LockRefused::Failed(ErrorDetail::from_transport(&err)))?;

        match reply.status.as_u16() {
            200 | 201 => {
                let token = reply
                    .header("lock-token")
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .or_else(|| {
                        extract_prefixed("locktoken", &reply.body)
                            .and_then(extract_href)
                            .map(|href| format!("<{}>", href))
                    })
                    // A token that cannot be echoed back in `If` could never be released.
                    .filter(|token| HeaderValue::from_str(token).is_ok());
                match token {
                    Some(token) => {
                        debug!(%resource, "lock acquired");
                        Ok(LockToken::new(token))
                    }
                    None => Err(LockRefused::Failed(ErrorDetail::new(
                        i64::from(reply.status.as_u16()),
                        "LOCK succeeded without a usable lock token",
                    ))),
                }
            }
            423 => Err(LockRefused::Locked(ErrorDetail::from_reply(&reply))),
            501 => {
                debug!(%resource, "LOCK not implemented, continuing unlocked");
                Ok(LockToken::placeholder())
            }
            _ => Err(LockRefused::Failed(ErrorDetail::from_reply(&reply))),
        }
    }

    /// Remove a lock. Placeholder tokens are a no-op.
    pub fn release(&self, resource: &Url, token: &LockToken) -> Result<(), ErrorDetail> {
        if token.is_placeholder() {
            return Ok(());
        }
        let request = DavRequest::new(Verb::Unlock, resource.clone())
            .try_header(HeaderName::from_static("lock-token"), token.as_str())?;
        let reply = self
            .transport
            .send(self.target, &request)
            .map_err(|err| ErrorDetail::from_transport(&err))?;
        if reply.is_success() {
            debug!(%resource, "lock released");
            Ok(())
        } else {
            Err(ErrorDetail::from_reply(&reply))
        }
    }

    /// Acquire a lock that is released when the guard goes out of scope.
    pub fn lock(&self, resource: &Url) -> Result<LockGuard<'_, 'a, T>, LockRefused> {
        let token = self.acquire(resource)?;
        Ok(LockGuard {
            coordinator: self,
            resource: resource.clone(),
            token: Some(token),
        })
    }
}

/// Holds a lock for the duration of one write.
///
/// Release is best-effort and happens on every exit path; its failure is
/// logged and never replaces the outcome of the write.
pub struct LockGuard<'c, 'a, T: Transport> {
    coordinator: &'c LockCoordinator<'a, T>,
    resource: Url,
    token: Option<LockToken>,
}

impl<T: Transport> LockGuard<'_, '_, T> {
    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    /// Release now rather than at drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(detail) = self.coordinator.release(&self.resource, &token) {
                warn!(resource = %self.resource, code = detail.code, "failed to release lock: {}", detail.message);
            }
        }
    }
}

impl<T: Transport> Drop for LockGuard<'_, '_, T> {
    fn drop(&mut self) {
        self.release_inner();
    }
}
