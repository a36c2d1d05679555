//! Session-scoped vendor access.
//!
//! Some vendors expose a single, non-reentrant session: log in, issue queries,
//! log out. `SessionSource` owns such a client behind one async mutex so every
//! fetch runs as a scoped `login → query → logout` sequence and concurrent
//! callers queue instead of interleaving session state.

use super::provider::{RawRow, SourceAdapter, SourceError};
use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One query issued inside a vendor session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    Daily {
        code: String,
        start: NaiveDate,
        end: NaiveDate,
    },
    Intraday {
        code: String,
        start: NaiveDate,
        end: NaiveDate,
    },
    Fundamentals {
        code: String,
        year: i32,
        quarter: u32,
    },
}

/// A vendor client with explicit session management.
#[async_trait]
pub trait SessionClient: Send {
    async fn login(&mut self) -> Result<(), SourceError>;

    async fn logout(&mut self) -> Result<(), SourceError>;

    async fn query(&mut self, request: &SessionRequest) -> Result<Vec<RawRow>, SourceError>;
}

struct SessionSlot<C> {
    client: C,
    /// Set between a successful login and the matching logout. Still set on
    /// entry means the previous caller was cancelled mid-query.
    open: bool,
}

pub struct SessionSource<C> {
    name: String,
    slot: Mutex<SessionSlot<C>>,
}

impl<C: SessionClient> SessionSource<C> {
    pub fn new(name: impl Into<String>, client: C) -> Self {
        Self {
            name: name.into(),
            slot: Mutex::new(SessionSlot {
                client,
                open: false,
            }),
        }
    }

    /// Run one request inside a fresh session. Logout runs on every exit path.
    pub async fn run(&self, request: SessionRequest) -> Result<Vec<RawRow>, SourceError> {
        let mut slot = self.slot.lock().await;

        if slot.open {
            warn!(provider = %self.name, "closing session left open by a cancelled caller");
            if let Err(e) = slot.client.logout().await {
                warn!(provider = %self.name, error = %e, "stale session logout failed");
            }
            slot.open = false;
        }

        slot.client.login().await.map_err(|e| match e {
            SourceError::LoginFailed(_) => e,
            other => SourceError::LoginFailed(other.to_string()),
        })?;
        slot.open = true;
        debug!(provider = %self.name, ?request, "session opened");

        let result = slot.client.query(&request).await;

        if let Err(e) = slot.client.logout().await {
            warn!(provider = %self.name, error = %e, "session logout failed");
        }
        slot.open = false;

        result
    }

    /// Hand the client back, e.g. to inspect a test double.
    pub fn into_inner(self) -> C {
        self.slot.into_inner().client
    }
}

#[async_trait]
impl<C: SessionClient + 'static> SourceAdapter for SessionSource<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawRow>, SourceError> {
        self.run(SessionRequest::Daily {
            code: code.to_string(),
            start,
            end,
        })
        .await
    }

    async fn fetch_intraday(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawRow>, SourceError> {
        self.run(SessionRequest::Intraday {
            code: code.to_string(),
            start,
            end,
        })
        .await
    }

    async fn fetch_fundamentals(
        &self,
        code: &str,
        year: i32,
        quarter: u32,
    ) -> Result<Vec<RawRow>, SourceError> {
        self.run(SessionRequest::Fundamentals {
            code: code.to_string(),
            year,
            quarter,
        })
        .await
    }
}
