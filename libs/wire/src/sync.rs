//! Paged transfer of a [`StateSnapshot`].
//!
//! A full snapshot outgrows one framed message long before the cluster hits
//! its connection limits, so a sync carries only a [`SyncHeader`] in the
//! peer request or reply and the deltas follow as [`SyncPage`] messages,
//! nodes first. The page flagged `last` ends the transfer.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{read_message, write_message, EndpointDelta, NodeDelta, NodeMeta, StateSnapshot, WireError};

/// Deltas per page. The largest delta encodes to well under 300 bytes, so
/// a full page stays far below [`crate::MAX_MESSAGE_LEN`].
pub const SYNC_PAGE_LEN: usize = 1024;

/// Pages a reader accepts for one snapshot.
pub const MAX_SYNC_PAGES: usize = 4096;

/// Opens a sync in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHeader {
    pub from: NodeMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPage {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeDelta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<EndpointDelta>,
    #[serde(default)]
    pub last: bool,
}

impl StateSnapshot {
    pub fn header(&self) -> SyncHeader {
        SyncHeader { from: self.from }
    }

    /// Split into pages of at most `page_len` deltas. Always yields at least
    /// one page and flags only the final one.
    pub fn into_pages(self, page_len: usize) -> Vec<SyncPage> {
        let page_len = page_len.max(1);
        let mut pages = Vec::new();
        let mut current = SyncPage::default();

        for node in self.nodes {
            if current.nodes.len() == page_len {
                pages.push(std::mem::take(&mut current));
            }
            current.nodes.push(node);
        }
        for endpoint in self.endpoints {
            if current.nodes.len() + current.endpoints.len() == page_len {
                pages.push(std::mem::take(&mut current));
            }
            current.endpoints.push(endpoint);
        }
        current.last = true;
        pages.push(current);
        pages
    }
}

/// Write the pages of `snapshot`. The header goes out separately, inside
/// the peer request or reply.
pub async fn write_sync_pages<W>(writer: &mut W, snapshot: StateSnapshot) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    for page in snapshot.into_pages(SYNC_PAGE_LEN) {
        write_message(writer, &page).await?;
    }
    Ok(())
}

/// Read pages up to the last one and reassemble the snapshot announced by
/// `header`.
pub async fn read_sync_pages<R>(reader: &mut R, header: SyncHeader) -> Result<StateSnapshot, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut snapshot = StateSnapshot {
        from: header.from,
        nodes: Vec::new(),
        endpoints: Vec::new(),
    };
    for _ in 0..MAX_SYNC_PAGES {
        let page: SyncPage = read_message(reader).await?;
        snapshot.nodes.extend(page.nodes);
        snapshot.endpoints.extend(page.endpoints);
        if page.last {
            return Ok(snapshot);
        }
    }
    Err(WireError::TooLarge {
        len: MAX_SYNC_PAGES + 1,
        max: MAX_SYNC_PAGES,
    })
}
