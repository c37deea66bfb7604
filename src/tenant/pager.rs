use async_trait::async_trait;
use std::collections::VecDeque;

use crate::storage::{PageCursor, StorageError};

/// A keyset-paginated listing.
#[async_trait]
pub trait PageSource: Send + Sync {
    type Item: Send;

    /// Items strictly after `after`, at most `limit`, in cursor order.
    async fn fetch(
        &self,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<Self::Item>, StorageError>;

    fn cursor(item: &Self::Item) -> PageCursor;
}

/// Lazy sequence over a `PageSource`, fetching one page at a time.
pub struct Pager<S: PageSource> {
    source: S,
    page_size: usize,
    buffer: VecDeque<S::Item>,
    cursor: Option<PageCursor>,
    exhausted: bool,
}

impl<S: PageSource> Pager<S> {
    pub fn new(source: S, page_size: usize) -> Self {
        Pager {
            source,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
        }
    }

    /// Resume a listing after a previously returned item.
    pub fn starting_after(mut self, cursor: Option<PageCursor>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Next item, fetching a new page when the buffer runs dry.
    pub async fn next(&mut self) -> Result<Option<S::Item>, StorageError> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        Ok(self.buffer.pop_front())
    }

    /// Up to one page worth of items.
    pub async fn next_page(&mut self) -> Result<Vec<S::Item>, StorageError> {
        let mut page = Vec::with_capacity(self.page_size);
        while page.len() < self.page_size {
            match self.next().await? {
                Some(item) => page.push(item),
                None => break,
            }
        }
        Ok(page)
    }

    /// Drain up to `max` items.
    pub async fn collect(mut self, max: usize) -> Result<Vec<S::Item>, StorageError> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.next().await? {
                Some(item) => out.push(item),
                None => break,
            }
        }
        Ok(out)
    }

    async fn fill(&mut self) -> Result<(), StorageError> {
        let page = self.source.fetch(self.cursor, self.page_size).await?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(S::cursor(last));
        }
        self.buffer.extend(page);
        Ok(())
    }
}
