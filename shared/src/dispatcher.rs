//! Tag-indexed command dispatch
//!
//! A [`CommandDispatcher`] is built once when a host starts: one handler per
//! command tag, each wrapping the decode routine of the payload bound to that
//! tag. After construction the table is only read, so dispatch is a single
//! index into a vector.

use crate::error::ProtocolError;
use crate::protocol::{decode_payload, split_tag, Command, Payload};
use std::marker::PhantomData;

type BoundHandler<H, S> = Box<dyn Fn(&mut H, S, &[u8]) -> Result<(), ProtocolError> + Send + Sync>;

/// Maps command tags of role `C` to handlers on host `H`.
///
/// `S` is the source passed to handlers alongside the payload: the sender's
/// address on a server, `()` on a client that only talks to one peer.
pub struct CommandDispatcher<H, C, S = ()> {
    handlers: Vec<Option<BoundHandler<H, S>>>,
    _command: PhantomData<C>,
}

impl<H: 'static, C: Command, S: Copy + 'static> CommandDispatcher<H, C, S> {
    pub fn new() -> Self {
        Self {
            handlers: (0..C::COUNT).map(|_| None).collect(),
            _command: PhantomData,
        }
    }

    /// Binds `handler` to the tag of payload type `P`.
    ///
    /// The payload is fully decoded, trailing bytes included, before the
    /// handler runs, so a malformed packet never reaches host state.
    pub fn register<P>(mut self, handler: fn(&mut H, S, P)) -> Self
    where
        P: Payload<Command = C> + 'static,
    {
        let bound = move |host: &mut H, source: S, bytes: &[u8]| -> Result<(), ProtocolError> {
            let payload = decode_payload::<P>(bytes)?;
            handler(host, source, payload);
            Ok(())
        };
        self.handlers[P::COMMAND.index()] = Some(Box::new(bound));
        self
    }

    pub fn is_registered(&self, command: C) -> bool {
        self.handlers[command.index()].is_some()
    }

    /// Decodes the tag of `packet` and runs the bound handler.
    ///
    /// Returns the command that was handled. Unknown tags, tags without a
    /// handler and malformed payloads are reported as [`ProtocolError`]s and
    /// leave the host untouched.
    pub fn dispatch(&self, host: &mut H, source: S, packet: &[u8]) -> Result<C, ProtocolError> {
        let (tag, payload) = split_tag(packet)?;
        let command = C::from_tag(tag).ok_or(ProtocolError::UnknownCommand(tag))?;
        let handler = self.handlers[command.index()]
            .as_ref()
            .ok_or(ProtocolError::Unhandled(tag))?;
        handler(host, source, payload)?;
        Ok(command)
    }
}

impl<H: 'static, C: Command, S: Copy + 'static> Default for CommandDispatcher<H, C, S> {
    fn default() -> Self {
        Self::new()
    }
}
