//! Messages and transaction handles.

use std::collections::BTreeMap;

use crate::resource::ResourceId;

/// An AMQP message as seen by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    body: Vec<u8>,
    properties: BTreeMap<String, String>,
    delivery_tag: Option<u64>,
    receipt: Option<Receipt>,
}

/// Which consumer link handed out a delivery.
///
/// Stamped by the consumer on receive so settlement can tell a live
/// delivery from one that predates a recovery cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Receipt {
    pub(crate) consumer: ResourceId,
    pub(crate) generation: u64,
}

impl Message {
    /// Creates a message with the given body.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            properties: BTreeMap::new(),
            delivery_tag: None,
            receipt: None,
        }
    }

    /// Adds an application property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Sets the transport-level delivery tag.
    ///
    /// Called by transport implementations on inbound messages.
    pub fn with_delivery_tag(mut self, tag: u64) -> Self {
        self.delivery_tag = Some(tag);
        self
    }

    /// Raw body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as UTF-8, if it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Looks up an application property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// All application properties.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Delivery tag assigned by the link that delivered this message.
    pub fn delivery_tag(&self) -> Option<u64> {
        self.delivery_tag
    }

    pub(crate) fn stamp(mut self, consumer: ResourceId, generation: u64) -> Self {
        self.receipt = Some(Receipt {
            consumer,
            generation,
        });
        self
    }

    pub(crate) fn receipt(&self) -> Option<Receipt> {
        self.receipt
    }
}

impl From<&str> for Message {
    fn from(body: &str) -> Self {
        Message::new(body)
    }
}

impl From<String> for Message {
    fn from(body: String) -> Self {
        Message::new(body)
    }
}

/// An opaque transaction handle, passed through to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transaction {
    id: u64,
}

impl Transaction {
    /// Wraps a transport-assigned transaction id.
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    /// The transport-assigned id.
    pub fn id(&self) -> u64 {
        self.id
    }
}
