/// A single mutation observed on the store's change feed
///
/// Delivered in commit order per document id; no cross-id ordering is
/// promised. Update events always carry the post-image of the document.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<T> {
    /// A new document was inserted
    Insert { id: String, data: T },
    /// An existing document was rewritten; `data` is the post-image
    Update { id: String, data: T },
    /// The document was removed
    Delete { id: String },
}

impl<T> ChangeEvent<T> {
    /// The id of the document the event concerns
    pub fn id(&self) -> &str {
        match self {
            ChangeEvent::Insert { id, .. }
            | ChangeEvent::Update { id, .. }
            | ChangeEvent::Delete { id } => id,
        }
    }

    /// Short operation label for logs
    pub fn operation(&self) -> &'static str {
        match self {
            ChangeEvent::Insert { .. } => "insert",
            ChangeEvent::Update { .. } => "update",
            ChangeEvent::Delete { .. } => "delete",
        }
    }
}
