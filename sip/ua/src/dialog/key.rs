use bytesstr::BytesStr;
use std::fmt;

/// Identity of a dialog: Call-ID plus the two tags.
///
/// Early dialogs do not know the remote tag yet; the registry keeps a
/// secondary index on `(call_id, local_tag)` so responses can find
/// them. The key is completed exactly once, when the first tagged
/// response arrives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogKey {
    pub call_id: BytesStr,
    pub local_tag: BytesStr,
    pub remote_tag: Option<BytesStr>,
}

impl DialogKey {
    pub fn new(call_id: BytesStr, local_tag: BytesStr, remote_tag: Option<BytesStr>) -> Self {
        Self {
            call_id,
            local_tag,
            remote_tag,
        }
    }

    /// The early-index key of this dialog
    pub(crate) fn early(&self) -> EarlyKey {
        (self.call_id.clone(), self.local_tag.clone())
    }

    /// A copy of the key with the remote tag filled in
    pub(crate) fn completed(&self, remote_tag: BytesStr) -> Self {
        Self {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
            remote_tag: Some(remote_tag),
        }
    }
}

impl fmt::Display for DialogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.call_id,
            self.local_tag,
            self.remote_tag.as_deref().unwrap_or("-")
        )
    }
}

pub(crate) type EarlyKey = (BytesStr, BytesStr);
