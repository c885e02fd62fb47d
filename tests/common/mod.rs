//! Shared test fixtures: an in-memory userli backend.
#![allow(dead_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::time::Instant;

use userli_postfix_adapter::error::UserliError;
use userli_postfix_adapter::userli::{Quota, UserliApi};

/// In-memory stand-in for the userli backend.
///
/// With `fail` set, every call reports an HTTP 500 so error paths can be
/// exercised without a network.
#[derive(Default)]
pub struct MockUserli {
    pub aliases: HashMap<String, Vec<String>>,
    pub domains: Vec<String>,
    pub mailboxes: Vec<String>,
    pub senders: HashMap<String, Vec<String>>,
    pub quotas: HashMap<String, Quota>,
    pub fail: bool,
}

impl MockUserli {
    fn check(&self) -> Result<(), UserliError> {
        if self.fail {
            Err(UserliError::Status { status: 500 })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl UserliApi for MockUserli {
    async fn get_aliases(
        &self,
        _deadline: Option<Instant>,
        email: &str,
    ) -> Result<Vec<String>, UserliError> {
        self.check()?;
        Ok(self.aliases.get(email).cloned().unwrap_or_default())
    }

    async fn get_domain(
        &self,
        _deadline: Option<Instant>,
        domain: &str,
    ) -> Result<bool, UserliError> {
        self.check()?;
        Ok(self.domains.iter().any(|d| d == domain))
    }

    async fn get_mailbox(
        &self,
        _deadline: Option<Instant>,
        email: &str,
    ) -> Result<bool, UserliError> {
        self.check()?;
        Ok(self.mailboxes.iter().any(|m| m == email))
    }

    async fn get_senders(
        &self,
        _deadline: Option<Instant>,
        email: &str,
    ) -> Result<Vec<String>, UserliError> {
        self.check()?;
        Ok(self.senders.get(email).cloned().unwrap_or_default())
    }

    async fn get_quota(
        &self,
        _deadline: Option<Instant>,
        email: &str,
    ) -> Result<Quota, UserliError> {
        self.check()?;
        self.quotas
            .get(email)
            .copied()
            .ok_or(UserliError::Status { status: 404 })
    }
}
