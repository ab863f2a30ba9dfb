//! Shared access to multiplexed server channels: requests are serialized
//! one at a time per channel, replies matched by arrival order, and queued
//! callers resumed as the channel frees up.
//!
//! The protocol-specific encoding lives behind [`ShareProto`]; this layer
//! only owns the queueing discipline, so every channel client (file
//! services, remote command services, the directory channel, clipboard,
//! printing) shares one implementation.

use crate::error::{LinkError, LinkResult};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// The coupling between the generic request queue and one wire protocol.
pub trait ShareProto: 'static {
    type Cmd;
    type Reply: Default;

    /// Start an operation by converting the command into channel writes.
    fn send(
        &mut self,
        cmd: &Self::Cmd,
        reply: &mut Self::Reply,
        tx: &mut dyn FnMut(&[u8]) -> LinkResult<()>,
    ) -> LinkResult<()>;

    /// Complete an operation from the received reply data.
    fn receive(&mut self, cmd: &Self::Cmd, reply: &mut Self::Reply, data: &[u8]) -> LinkResult<()>;
}

/// Handle returned by a foreground (blocking-style) request. The caller
/// polls the stack until the result lands.
pub struct ForeHandle<R> {
    slot: Rc<RefCell<Option<LinkResult<R>>>>,
}

impl<R> ForeHandle<R> {
    #[inline]
    pub fn is_done(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Take the result if the operation has completed.
    #[inline]
    pub fn try_take(&self) -> Option<LinkResult<R>> {
        self.slot.borrow_mut().take()
    }
}

enum Completion<R> {
    Fore(Rc<RefCell<Option<LinkResult<R>>>>),
    Back(Box<dyn FnMut(LinkResult<()>, &R)>),
}

struct Pending<P: ShareProto> {
    cmd: P::Cmd,
    reply: P::Reply,
    completion: Completion<P::Reply>,
}

/// One shared channel: at most one request in flight, the rest queued in
/// arrival order.
pub struct SharedAccess<P: ShareProto> {
    proto: P,
    current: Option<Pending<P>>,
    queue: VecDeque<Pending<P>>,
}

impl<P: ShareProto> SharedAccess<P> {
    pub fn new(proto: P) -> SharedAccess<P> {
        SharedAccess {
            proto,
            current: None,
            queue: VecDeque::new(),
        }
    }

    #[inline]
    pub fn proto(&self) -> &P {
        &self.proto
    }

    #[inline]
    pub fn proto_mut(&mut self) -> &mut P {
        &mut self.proto
    }

    /// Is a request currently awaiting its reply.
    #[inline]
    pub fn busy(&self) -> bool {
        self.current.is_some()
    }

    #[inline]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queue an operation and return a handle for the caller to wait on.
    pub fn fore(&mut self, cmd: P::Cmd) -> ForeHandle<P::Reply> {
        let slot = Rc::new(RefCell::new(None));
        self.queue.push_back(Pending {
            cmd,
            reply: P::Reply::default(),
            completion: Completion::Fore(slot.clone()),
        });
        ForeHandle { slot }
    }

    /// Queue an operation with a completion callback invoked from the poll
    /// context, for success and failure alike.
    pub fn back<F: FnMut(LinkResult<()>, &P::Reply) + 'static>(&mut self, cmd: P::Cmd, callback: F) {
        self.queue.push_back(Pending {
            cmd,
            reply: P::Reply::default(),
            completion: Completion::Back(Box::new(callback)),
        });
    }

    /// Start the next queued request if none is in flight. Called on every
    /// idle poll of the owning channel.
    pub fn poll_idle(&mut self, tx: &mut dyn FnMut(&[u8]) -> LinkResult<()>) -> LinkResult<()> {
        if self.current.is_some() {
            return Ok(());
        }
        let mut pending = match self.queue.pop_front() {
            Some(pending) => pending,
            None => return Ok(()),
        };
        match self.proto.send(&pending.cmd, &mut pending.reply, tx) {
            Ok(()) => self.current = Some(pending),
            Err(err) => Self::complete(pending, Err(err)),
        }
        Ok(())
    }

    /// Complete the in-flight request from received reply data.
    pub fn poll_data(&mut self, data: &[u8]) -> LinkResult<()> {
        let mut pending = match self.current.take() {
            Some(pending) => pending,
            None => return Ok(()),
        };
        let result = self.proto.receive(&pending.cmd, &mut pending.reply, data);
        Self::complete(pending, result);
        Ok(())
    }

    /// Fail everything outstanding; used when the server channel goes
    /// away.
    pub fn shutdown(&mut self) {
        if let Some(pending) = self.current.take() {
            Self::complete(pending, Err(LinkError::Disconnected));
        }
        while let Some(pending) = self.queue.pop_front() {
            Self::complete(pending, Err(LinkError::Disconnected));
        }
    }

    fn complete(pending: Pending<P>, result: LinkResult<()>) {
        match pending.completion {
            Completion::Fore(slot) => {
                *slot.borrow_mut() = Some(result.map(|()| pending.reply));
            }
            Completion::Back(mut callback) => callback(result, &pending.reply),
        }
    }
}
