//! Block requests handed to a device's worker pool

use bytes::BytesMut;
use restblock_common::{Error, Result};

/// Transfer direction of a block request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Called exactly once with the served request
pub type CompletionFn = Box<dyn FnOnce(CompletedRequest) + Send + 'static>;

/// A request waiting in a device queue.
///
/// For writes the segments carry the data to store; for reads they are
/// filled in place. Segments are transferred in order as one contiguous
/// range starting at `offset`.
///
/// A request dropped without [`PendingRequest::complete`] completes with
/// [`Error::Interrupted`].
pub struct PendingRequest {
    direction: Direction,
    offset: u64,
    segments: Vec<BytesMut>,
    on_complete: Option<CompletionFn>,
}

/// Outcome of a request, handed back to the submitter
#[derive(Debug)]
pub struct CompletedRequest {
    pub direction: Direction,
    pub offset: u64,
    pub segments: Vec<BytesMut>,
    pub result: Result<()>,
}

impl CompletedRequest {
    /// Segments concatenated into one buffer
    #[must_use]
    pub fn into_data(self) -> BytesMut {
        let mut segments = self.segments.into_iter();
        let Some(mut data) = segments.next() else {
            return BytesMut::new();
        };
        for segment in segments {
            data.unsplit(segment);
        }
        data
    }
}

impl PendingRequest {
    pub fn new<F>(direction: Direction, offset: u64, segments: Vec<BytesMut>, on_complete: F) -> Self
    where
        F: FnOnce(CompletedRequest) + Send + 'static,
    {
        Self {
            direction,
            offset,
            segments,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    /// Read request with a single zeroed buffer of `len` bytes
    pub fn read<F>(offset: u64, len: usize, on_complete: F) -> Self
    where
        F: FnOnce(CompletedRequest) + Send + 'static,
    {
        Self::new(Direction::Read, offset, vec![BytesMut::zeroed(len)], on_complete)
    }

    /// Write request with a single buffer
    pub fn write<F>(offset: u64, data: BytesMut, on_complete: F) -> Self
    where
        F: FnOnce(CompletedRequest) + Send + 'static,
    {
        Self::new(Direction::Write, offset, vec![data], on_complete)
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Total byte length across all segments
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.iter().map(BytesMut::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub(crate) fn segments_mut(&mut self) -> &mut [BytesMut] {
        &mut self.segments
    }

    pub(crate) fn segments(&self) -> &[BytesMut] {
        &self.segments
    }

    /// Signal completion, consuming the request
    pub fn complete(mut self, result: Result<()>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<()>) {
        let Some(on_complete) = self.on_complete.take() else {
            return;
        };
        on_complete(CompletedRequest {
            direction: self.direction,
            offset: self.offset,
            segments: std::mem::take(&mut self.segments),
            result,
        });
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.finish(Err(Error::Interrupted));
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("direction", &self.direction)
            .field("offset", &self.offset)
            .field("len", &self.len())
            .field("segments", &self.segments.len())
            .finish_non_exhaustive()
    }
}
