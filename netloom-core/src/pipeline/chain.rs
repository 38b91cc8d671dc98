//! The ordered handler list.

use super::handler::{DuplexHandler, HandlerKind, InboundHandler, OutboundHandler};
use crate::codec::{ChannelHandler, Decoder, DecoderHandler, Encoder, EncoderHandler, HandlerAdapter};
use crate::error::PipelineError;

use std::fmt;

/// A named pipeline slot.
pub struct HandlerEntry {
    pub(crate) name: String,
    pub(crate) kind: HandlerKind,
}

impl HandlerEntry {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> &HandlerKind {
        &self.kind
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.name, self.kind)
    }
}

/// Ordered list of uniquely named handlers.
///
/// Insertion order is the inbound traversal order; outbound traversal runs
/// the same list backwards. A pipeline belongs to one channel. Build it
/// before the channel goes live, or edit it through
/// [`Channel::with_pipeline`](crate::channel::Channel::with_pipeline).
///
/// # Examples
///
/// ```
/// use netloom_core::pipeline::{HandlerKind, InboundHandler, Pipeline};
///
/// struct Pass;
/// impl InboundHandler for Pass {}
///
/// let mut pipeline = Pipeline::new();
/// pipeline.add_last("b", HandlerKind::inbound(Pass)).unwrap();
/// pipeline.add_first("a", HandlerKind::inbound(Pass)).unwrap();
/// pipeline.add_after("b", "c", HandlerKind::inbound(Pass)).unwrap();
/// assert_eq!(pipeline.names(), vec!["a", "b", "c"]);
/// ```
#[derive(Default)]
pub struct Pipeline {
    handlers: Vec<HandlerEntry>,
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(HandlerEntry::name).collect()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HandlerEntry> {
        self.handlers.iter().find(|entry| entry.name == name)
    }

    pub fn add_first(
        &mut self,
        name: impl Into<String>,
        kind: HandlerKind,
    ) -> Result<&mut Self, PipelineError> {
        self.insert(0, name.into(), kind)
    }

    pub fn add_last(
        &mut self,
        name: impl Into<String>,
        kind: HandlerKind,
    ) -> Result<&mut Self, PipelineError> {
        let at = self.handlers.len();
        self.insert(at, name.into(), kind)
    }

    pub fn add_before(
        &mut self,
        base: &str,
        name: impl Into<String>,
        kind: HandlerKind,
    ) -> Result<&mut Self, PipelineError> {
        let at = self.require(base)?;
        self.insert(at, name.into(), kind)
    }

    pub fn add_after(
        &mut self,
        base: &str,
        name: impl Into<String>,
        kind: HandlerKind,
    ) -> Result<&mut Self, PipelineError> {
        let at = self.require(base)? + 1;
        self.insert(at, name.into(), kind)
    }

    /// Remove a handler, returning it.
    pub fn remove(&mut self, name: &str) -> Result<HandlerKind, PipelineError> {
        let at = self.require(name)?;
        Ok(self.handlers.remove(at).kind)
    }

    /// Swap the handler registered as `old` for a new one, in place.
    pub fn replace(
        &mut self,
        old: &str,
        name: impl Into<String>,
        kind: HandlerKind,
    ) -> Result<HandlerKind, PipelineError> {
        let at = self.require(old)?;
        let name = name.into();
        if name != old && self.contains(&name) {
            return Err(PipelineError::DuplicateName(name));
        }
        let previous = std::mem::replace(&mut self.handlers[at], HandlerEntry { name, kind });
        Ok(previous.kind)
    }

    pub fn add_inbound(
        &mut self,
        name: impl Into<String>,
        handler: impl InboundHandler,
    ) -> Result<&mut Self, PipelineError> {
        self.add_last(name, HandlerKind::inbound(handler))
    }

    pub fn add_outbound(
        &mut self,
        name: impl Into<String>,
        handler: impl OutboundHandler,
    ) -> Result<&mut Self, PipelineError> {
        self.add_last(name, HandlerKind::outbound(handler))
    }

    pub fn add_duplex(
        &mut self,
        name: impl Into<String>,
        handler: impl DuplexHandler,
    ) -> Result<&mut Self, PipelineError> {
        self.add_last(name, HandlerKind::dual(handler))
    }

    /// Append a decoder wrapped in a cumulating inbound handler.
    pub fn add_decoder<D: Decoder>(
        &mut self,
        name: impl Into<String>,
        decoder: D,
    ) -> Result<&mut Self, PipelineError> {
        self.add_last(name, HandlerKind::inbound(DecoderHandler::new(decoder)))
    }

    /// Append an encoder wrapped in an outbound handler.
    pub fn add_encoder<E: Encoder>(
        &mut self,
        name: impl Into<String>,
        encoder: E,
    ) -> Result<&mut Self, PipelineError> {
        self.add_last(name, HandlerKind::outbound(EncoderHandler::new(encoder)))
    }

    /// Append the terminal application handler.
    pub fn add_handler<H: ChannelHandler>(
        &mut self,
        name: impl Into<String>,
        handler: H,
    ) -> Result<&mut Self, PipelineError> {
        self.add_last(name, HandlerKind::inbound(HandlerAdapter::new(handler)))
    }

    pub(crate) fn handlers_mut(&mut self) -> &mut [HandlerEntry] {
        &mut self.handlers
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.handlers.iter().position(|entry| entry.name == name)
    }

    fn require(&self, name: &str) -> Result<usize, PipelineError> {
        self.index_of(name)
            .ok_or_else(|| PipelineError::NotFound(name.to_owned()))
    }

    fn insert(
        &mut self,
        at: usize,
        name: String,
        kind: HandlerKind,
    ) -> Result<&mut Self, PipelineError> {
        if self.contains(&name) {
            return Err(PipelineError::DuplicateName(name));
        }
        self.handlers.insert(at, HandlerEntry { name, kind });
        Ok(self)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.handlers).finish()
    }
}
