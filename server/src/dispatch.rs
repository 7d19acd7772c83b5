//! Fan-out of built messages to sessions.

use crate::registry::SessionRegistry;
use log::debug;
use shared::framing::HEADER_LEN;
use shared::protocol::code_name;
use shared::{GameEvent, PlayerIndex};

/// One message ready to leave the server: the framed bytes and, when it was
/// built from an event, the event itself for in-process players.
#[derive(Debug, Clone, Copy)]
pub struct Outgoing<'a> {
    pub code: u16,
    pub frame: &'a [u8],
    pub event: Option<&'a GameEvent>,
}

impl<'a> Outgoing<'a> {
    pub fn payload(&self) -> &'a [u8] {
        self.frame.get(HEADER_LEN..).unwrap_or(&[])
    }
}

/// Routes messages to one session or to all of them.
///
/// A session that is gone or already closing is skipped silently. A send
/// that fails fatally closes that session on the spot; broadcasting walks a
/// snapshot of the indices taken up front, so such a removal never makes it
/// skip or repeat anyone else.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchRouter;

impl DispatchRouter {
    pub fn new() -> Self {
        Self
    }

    /// Returns true if the session accepted the message.
    pub fn send_to(
        &self,
        registry: &mut SessionRegistry,
        player: PlayerIndex,
        message: &Outgoing<'_>,
    ) -> bool {
        let Some(session) = registry.get_mut(player) else {
            return false;
        };
        if session.is_closed() {
            return false;
        }
        match session.sink_mut().deliver(player, message) {
            Ok(()) => true,
            Err(reason) => {
                debug!(
                    "Sending {} to player {} failed: {}",
                    code_name(message.code),
                    player,
                    reason
                );
                registry.remove(player, reason);
                false
            }
        }
    }

    /// Delivers to every session live when the broadcast starts. Returns
    /// how many accepted it.
    pub fn broadcast(&self, registry: &mut SessionRegistry, message: &Outgoing<'_>) -> usize {
        registry
            .indices()
            .into_iter()
            .filter(|&player| self.send_to(registry, player, message))
            .count()
    }
}
