//! The link directory service client. Symbolic server names are resolved
//! to connectable channel names through the remote `LINK.*` service, so a
//! refused connect can be upgraded once the real name is known.

use crate::error::{LinkError, LinkResult};
use crate::mux::{EventKind, MsgBuffer, MuxOp};
use crate::status;
use crate::wire;
use filament::logging::{debug, o, Logger};
use std::collections::VecDeque;

pub(crate) const REGISTRY_CHANNEL: u8 = 1;
pub(crate) const REGISTRY_NAME: &str = "LINK.*";
pub(crate) const REGISTRY_MTU: usize = 300;

const OP_LOAD_PROCESS: u8 = 0x00;
const OP_RESPONSE: u8 = 0x01;

const CMD_SIZE: usize = 18;
const NAME_MIN: usize = 4;
const NAME_SUFFIX: &str = ".*";
const MAX_ID: u16 = 0xFFFF;

/// Context for the registry while its channel is being polled.
pub(crate) struct RegistryCtx<'a> {
    pub server_peer: u8,
    pub server_tx: &'a mut MsgBuffer,
    pub ops: &'a mut Vec<MuxOp>,
}

struct Pending {
    requester: u8,
    name: String,
}

/// Serialized access to the remote directory: one LOAD_PROCESS request in
/// flight, the rest queued.
pub(crate) struct Registry {
    connected: bool,
    current: Option<Pending>,
    queue: VecDeque<Pending>,
    id: u16,
    log: Logger,
}

impl Registry {
    pub(crate) fn new(log: &Logger) -> Registry {
        Registry {
            connected: false,
            current: None,
            queue: VecDeque::new(),
            id: 0,
            log: log.new(o!("component" => "registry")),
        }
    }

    /// Queue a resolution on behalf of a channel.
    pub(crate) fn enqueue(&mut self, requester: u8, name: String) {
        debug!(self.log, "registration queued"; "context" => "enqueue", "chan" => requester, "name" => &name);
        self.queue.push_back(Pending { requester, name });
    }

    /// Drop all state, failing any queued work.
    pub(crate) fn reset(&mut self) {
        self.connected = false;
        self.current = None;
        self.queue.clear();
    }

    pub(crate) fn poll(
        &mut self,
        event: EventKind,
        data: &[u8],
        ctx: &mut RegistryCtx<'_>,
    ) -> LinkResult<()> {
        match event {
            EventKind::ServerConnected => {
                debug!(self.log, "directory service connected"; "context" => "poll");
                self.connected = true;
                Ok(())
            }
            EventKind::ServerDisconnected | EventKind::ServerFailed | EventKind::End => {
                self.connected = false;
                self.fail_all(ctx);
                Ok(())
            }
            EventKind::ServerData => self.on_data(data, ctx),
            EventKind::Idle => self.on_idle(ctx),
            _ => Ok(()),
        }
    }

    /// Start the next queued resolution when the channel is free.
    fn on_idle(&mut self, ctx: &mut RegistryCtx<'_>) -> LinkResult<()> {
        if !self.connected
            || ctx.server_peer == 0
            || self.current.is_some()
            || ctx.server_tx.pending()
        {
            return Ok(());
        }
        let pending = match self.queue.pop_front() {
            Some(pending) => pending,
            None => return Ok(()),
        };

        self.id = if self.id < MAX_ID { self.id + 1 } else { 0 };

        let mut cmd = [0u8; CMD_SIZE];
        let mut writer = wire::Writer::new(&mut cmd);
        writer.put_u8(OP_LOAD_PROCESS).expect("command header fits");
        writer.put_u16(self.id).expect("command header fits");
        if writer.put_str(&pending.name).is_err() {
            // Name too long for a directory request
            ctx.ops.push(MuxOp::ResolveFailed {
                requester: pending.requester,
            });
            return Ok(());
        }

        debug!(self.log, "registering server"; "context" => "send", "id" => self.id, "name" => &pending.name);
        ctx.server_tx.deposit(&cmd)?;
        self.current = Some(pending);
        Ok(())
    }

    /// Handle the directory's reply to the in-flight request.
    fn on_data(&mut self, data: &[u8], ctx: &mut RegistryCtx<'_>) -> LinkResult<()> {
        let pending = match self.current.take() {
            Some(pending) => pending,
            None => return Ok(()),
        };
        match self.parse_reply(&pending, data) {
            Ok(name) => {
                debug!(self.log, "server registered"; "context" => "reply", "name" => &name);
                ctx.ops.push(MuxOp::Resolved {
                    requester: pending.requester,
                    name,
                });
            }
            Err(err) => {
                debug!(self.log, "registration failed"; "context" => "reply", "error" => %err);
                ctx.ops.push(MuxOp::ResolveFailed {
                    requester: pending.requester,
                });
            }
        }
        Ok(())
    }

    fn parse_reply(&self, pending: &Pending, data: &[u8]) -> LinkResult<String> {
        let mut reader = wire::Reader::new(data);
        if reader.get_u8()? != OP_RESPONSE {
            return Err(LinkError::BadParms);
        }
        if reader.get_u16()? != self.id {
            return Err(LinkError::BadParms);
        }
        let code = reader.get_u16()? as i16;
        status::sibo_status(code).map_err(LinkError::Remote)?;
        let _ = reader.get_u16()?;

        // Use the returned name if it is sensible, otherwise fall back to
        // the conventional suffix
        match reader.get_str() {
            Ok(name) if Registry::valid_name(name) => Ok(name.to_string()),
            _ => Ok(format!("{}{}", pending.name, NAME_SUFFIX)),
        }
    }

    fn valid_name(name: &str) -> bool {
        name.len() >= NAME_MIN && name.chars().all(|c| c.is_ascii_graphic() || c == ' ')
    }

    fn fail_all(&mut self, ctx: &mut RegistryCtx<'_>) {
        if let Some(pending) = self.current.take() {
            ctx.ops.push(MuxOp::ResolveFailed {
                requester: pending.requester,
            });
        }
        while let Some(pending) = self.queue.pop_front() {
            ctx.ops.push(MuxOp::ResolveFailed {
                requester: pending.requester,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::RemoteError;
    use filament::logging::{Discard, Logger};

    fn registry() -> Registry {
        Registry::new(&Logger::root(Discard, o!()))
    }

    fn reply(id: u16, code: i16, name: Option<&str>) -> Vec<u8> {
        let mut data = [0u8; 64];
        let mut writer = wire::Writer::new(&mut data);
        writer.put_u8(OP_RESPONSE).unwrap();
        writer.put_u16(id).unwrap();
        writer.put_u16(code as u16).unwrap();
        writer.put_u16(0).unwrap();
        if let Some(name) = name {
            writer.put_str(name).unwrap();
        }
        let used = writer.position();
        data[..used].to_vec()
    }

    #[test]
    fn test_parse_reply_named() {
        let mut registry = registry();
        registry.id = 7;
        let pending = Pending {
            requester: 2,
            name: String::from("CLIPSVR"),
        };
        let data = reply(7, 0, Some("CLIPSVR.RSY"));
        assert_eq!(registry.parse_reply(&pending, &data).unwrap(), "CLIPSVR.RSY");
    }

    #[test]
    fn test_parse_reply_fallback_suffix() {
        let mut registry = registry();
        registry.id = 1;
        let pending = Pending {
            requester: 2,
            name: String::from("CLIPSVR"),
        };
        // Too-short returned names fall back to the conventional suffix
        let data = reply(1, 0, Some("AB"));
        assert_eq!(registry.parse_reply(&pending, &data).unwrap(), "CLIPSVR.*");
        let data = reply(1, 0, None);
        assert_eq!(registry.parse_reply(&pending, &data).unwrap(), "CLIPSVR.*");
    }

    #[test]
    fn test_parse_reply_status_error() {
        let mut registry = registry();
        registry.id = 3;
        let pending = Pending {
            requester: 2,
            name: String::from("CLIPSVR"),
        };
        let data = reply(3, -33, None);
        assert_eq!(
            registry.parse_reply(&pending, &data),
            Err(LinkError::Remote(RemoteError::NotFound))
        );
    }

    #[test]
    fn test_parse_reply_id_mismatch() {
        let mut registry = registry();
        registry.id = 3;
        let pending = Pending {
            requester: 2,
            name: String::from("CLIPSVR"),
        };
        let data = reply(4, 0, None);
        assert_eq!(registry.parse_reply(&pending, &data), Err(LinkError::BadParms));
    }

    #[test]
    fn test_id_wraps() {
        let mut registry = registry();
        registry.id = MAX_ID;
        let mut buffer = MsgBuffer::new(REGISTRY_MTU);
        let mut ops = Vec::new();
        let mut ctx = RegistryCtx {
            server_peer: 9,
            server_tx: &mut buffer,
            ops: &mut ops,
        };
        registry.connected = true;
        registry.enqueue(2, String::from("SYS$RPCS"));
        registry.on_idle(&mut ctx).unwrap();
        assert_eq!(registry.id, 0);
        assert!(ctx.server_tx.pending());
    }
}
