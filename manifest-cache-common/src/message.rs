use std::collections::HashMap;

/// Attribute carrying the stable identifier of the record inside a message.
pub const ATTRIBUTE_KEY_RECORD_ID: &str = "id";

/// Where the true payload of a message lives, as decided by the queue client.
///
/// Oversized messages keep their payload in an auxiliary bucket and the queue
/// only carries a pointer. The marker is opaque to everything but the queue
/// client, which uses it to manage the lifecycle of the bucket object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance(Location);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum Location {
    #[default]
    Inline,
    External {
        bucket: String,
        key: String,
    },
}

impl Provenance {
    pub fn inline() -> Self {
        Self(Location::Inline)
    }

    pub fn oversized(bucket: &str, key: &str) -> Self {
        Self(Location::External {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
        })
    }

    pub fn is_oversized(&self) -> bool {
        matches!(self.0, Location::External { .. })
    }

    /// The bucket object holding the payload, for oversized messages.
    pub fn external_location(&self) -> Option<(&str, &str)> {
        match &self.0 {
            Location::Inline => None,
            Location::External { bucket, key } => Some((bucket, key)),
        }
    }
}

/// A single queue message: a document payload and its string attributes.
///
/// Messages are deliberately not `Clone`: a message read off a queue carries a
/// receipt handle that must not leak into copies meant for republishing. Use
/// `content_clone` for those.
#[derive(Debug, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
    provenance: Provenance,
    receipt_handle: Option<String>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            attributes: HashMap::new(),
            provenance: Provenance::inline(),
            receipt_handle: None,
        }
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn with_receipt_handle(mut self, receipt_handle: &str) -> Self {
        self.receipt_handle = Some(receipt_handle.to_owned());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn record_id(&self) -> Option<&str> {
        self.attribute(ATTRIBUTE_KEY_RECORD_ID)
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn receipt_handle(&self) -> Option<&str> {
        self.receipt_handle.as_deref()
    }

    /// Copy payload and attributes into a new message for republishing.
    /// The provenance marker is kept, the receipt handle is not.
    pub fn content_clone(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            attributes: self.attributes.clone(),
            provenance: self.provenance.clone(),
            receipt_handle: None,
        }
    }

    /// A short description for log lines: the record id if there is one.
    pub fn describe(&self, index: usize) -> String {
        match self.record_id() {
            Some(id) => format!("id {id}"),
            None => format!("message {index}"),
        }
    }
}
