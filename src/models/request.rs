//! Request descriptor
//!
//! The parts of an inbound HTTP request that tenant resolution looks at.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::utils::errors::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestDescriptor {
    pub headers: BTreeMap<String, String>,
    pub host: Option<String>,
    pub path: String,
    pub query: BTreeMap<String, String>,
    /// Business address the event was delivered to, when the adapter knows it
    pub channel_address: Option<String>,
}

impl RequestDescriptor {
    pub fn new() -> Self {
        Self {
            path: "/".to_string(),
            ..Self::default()
        }
    }

    /// Build a descriptor from an absolute URL
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)?;
        let query = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok(Self {
            headers: BTreeMap::new(),
            host: url.host_str().map(str::to_string),
            path: url.path().to_string(),
            query,
            channel_address: None,
        })
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_channel_address(mut self, address: &str) -> Self {
        self.channel_address = Some(address.to_string());
        self
    }

    /// Case-insensitive header lookup; empty values count as absent
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// Host without port
    pub fn hostname(&self) -> Option<&str> {
        self.host
            .as_deref()
            .map(|host| host.split(':').next().unwrap_or(host))
            .filter(|host| !host.is_empty())
    }
}
